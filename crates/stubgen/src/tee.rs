//! Body tee: split a streaming body into the live stream the peer reads
//! and a captured copy for the flow store. The live side sees every frame
//! (and every error) unchanged; the captured side resolves once the
//! stream ends, either with the full relayed bytes or, when the stream
//! failed or was abandoned mid-read, with the partial bytes inside a
//! [`CaptureInterrupted`].

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use tokio::sync::oneshot;

pin_project! {
	/// A body wrapper that appends every data frame it relays to a growing
	/// buffer. The buffer is delivered through a oneshot when the inner
	/// body finishes or fails. Dropping the tee mid-stream drops the
	/// sender, and the captured side resolves interrupted with no bytes.
	pub struct TeeBody<B> {
		sender: Option<oneshot::Sender<Result<Bytes, CaptureInterrupted>>>,
		buffer: BytesMut,
		#[pin]
		inner: B,
	}
}

/// A capture that did not run to completion: the live stream failed
/// mid-read or was abandoned. Holds whatever was relayed before that.
#[derive(Debug)]
pub struct CaptureInterrupted {
	pub partial: Bytes,
}

impl fmt::Display for CaptureInterrupted {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "interrupted after {} bytes", self.partial.len())
	}
}

impl std::error::Error for CaptureInterrupted {}

/// The captured side of a [`tee`].
pub struct CapturedBody {
	rx: oneshot::Receiver<Result<Bytes, CaptureInterrupted>>,
}

impl CapturedBody {
	/// Resolves once the live stream ends. `Err` carries the partial
	/// bytes when the stream errored or the tee was dropped mid-read.
	pub async fn bytes(self) -> Result<Bytes, CaptureInterrupted> {
		match self.rx.await {
			Ok(result) => result,
			Err(_) => Err(CaptureInterrupted {
				partial: Bytes::new(),
			}),
		}
	}
}

pub fn tee<B>(inner: B) -> (TeeBody<B>, CapturedBody)
where
	B: Body<Data = Bytes>,
{
	let (tx, rx) = oneshot::channel();
	(
		TeeBody {
			sender: Some(tx),
			buffer: BytesMut::new(),
			inner,
		},
		CapturedBody { rx },
	)
}

impl<B> Body for TeeBody<B>
where
	B: Body<Data = Bytes>,
{
	type Data = Bytes;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let res = match ready!(this.inner.poll_frame(cx)) {
			None => {
				if let Some(tx) = this.sender.take() {
					let _ = tx.send(Ok(this.buffer.split().freeze()));
				}
				None
			},
			Some(Ok(frame)) => {
				if let Some(data) = frame.data_ref() {
					this.buffer.extend_from_slice(data);
				}
				Some(Ok(frame))
			},
			Some(Err(err)) => {
				// The consumer sees the error; the capture keeps what
				// arrived before it.
				if let Some(tx) = this.sender.take() {
					let _ = tx.send(Err(CaptureInterrupted {
						partial: this.buffer.split().freeze(),
					}));
				}
				Some(Err(err))
			},
		};
		Poll::Ready(res)
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.inner.size_hint()
	}
}
