//! Recording HTTP/HTTPS proxy that emits mock servers for the traffic it saw.
//!
//! The crate has two halves. The capture half ([`proxy`], [`ca`], [`tee`],
//! [`flow`]) runs a forward proxy that MITMs CONNECT tunnels with per-host
//! certificates minted from a user-supplied root CA and records every
//! request/response pair, bodies included, without buffering the live
//! streams. The synthesis half ([`canon`], [`tree`], [`emit`]) folds the
//! recorded flows into a prefix-shared decision tree and lowers that tree
//! into the source of a standalone multi-server mock binary.

pub mod ca;
pub mod canon;
pub mod emit;
pub mod flow;
pub mod proxy;
pub mod tee;
pub mod tree;

pub use ca::CertAuthority;
pub use flow::{Flow, FlowStore};
pub use proxy::Proxy;
pub use tree::Tree;
