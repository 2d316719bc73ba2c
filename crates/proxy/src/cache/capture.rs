use std::cmp;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes, BytesMut};
use http_body::Frame;
use pin_project_lite::pin_project;
use tokio::sync::oneshot;

use crate::http::Body;

/// Resolution of a [`CaptureBody`]'s side channel: either the full body was
/// captured within `limit`, or the accumulator would have overflowed and
/// capture was abandoned.
///
/// This is the key difference from the teacher's `PeekBody`: `PeekBody`
/// truncates at `limit` and always resolves with *something*. A cache
/// entry that silently stored a truncated body would violate spec.md
/// §4.3's storability bound in the worst possible way — it would validate
/// the `len(body) <= max_object_bytes` invariant while serving corrupted
/// bytes on the next hit. So here, overflow aborts the whole capture
/// instead.
#[derive(Debug)]
pub enum CaptureOutcome {
	Captured(Bytes),
	Overflowed,
}

pin_project! {
	struct Inner {
		limit: usize,
		sender: Option<oneshot::Sender<CaptureOutcome>>,
		buffer: BytesMut,
		overflowed: bool,
		#[pin]
		inner: Body,
	}
}

impl http_body::Body for Inner {
	type Data = Bytes;
	type Error = crate::http::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let res = match ready!(this.inner.poll_frame(cx)) {
			None => {
				if let Some(sender) = this.sender.take() {
					let outcome = if *this.overflowed {
						CaptureOutcome::Overflowed
					} else {
						CaptureOutcome::Captured(this.buffer.split().freeze())
					};
					let _ = sender.send(outcome);
				}
				None
			},
			Some(Ok(frame)) => {
				if let Some(data) = frame.data_ref()
					&& this.sender.is_some()
					&& !*this.overflowed
				{
					let remaining = this.limit.saturating_sub(this.buffer.len());
					let take = cmp::min(remaining, data.len());
					if take < data.len() {
						// Would overflow: abort the capture entirely rather
						// than store a truncated prefix.
						*this.overflowed = true;
						this.buffer.clear();
						if let Some(sender) = this.sender.take() {
							let _ = sender.send(CaptureOutcome::Overflowed);
						}
					} else {
						this.buffer.extend_from_slice(&data.slice(0..take));
					}
				}
				Some(Ok(frame))
			},
			Some(Err(err)) => Some(Err(err)),
		};
		Poll::Ready(res)
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> http_body::SizeHint {
		self.inner.size_hint()
	}
}

/// Wraps `body` so its frames are forwarded to the client unchanged while a
/// bounded copy accumulates in a side buffer (spec.md §4.3's "streaming
/// tee"). Returns the (still streaming, unmodified) replacement body and a
/// receiver that resolves once the tee has finished or aborted.
pub struct CaptureBody;

impl CaptureBody {
	pub fn wrap(body: Body, limit: usize) -> (Body, oneshot::Receiver<CaptureOutcome>) {
		let (sender, receiver) = oneshot::channel();
		let inner = Inner {
			limit,
			sender: Some(sender),
			buffer: BytesMut::new(),
			overflowed: false,
			inner: body,
		};
		(Body::new(inner), receiver)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;

	async fn drain(body: Body) -> Bytes {
		axum::body::to_bytes(body, 10 * 1024 * 1024).await.unwrap()
	}

	#[tokio::test]
	async fn captures_bodies_within_limit() {
		let payload = Bytes::from_static(b"hello world");
		let (tee, rx) = CaptureBody::wrap(Body::from(payload.clone()), 100);
		let drained = drain(tee).await;
		assert_eq!(drained, payload);
		match rx.await.unwrap() {
			CaptureOutcome::Captured(b) => assert_eq!(b, payload),
			CaptureOutcome::Overflowed => panic!("expected a capture"),
		}
	}

	#[tokio::test]
	async fn aborts_without_truncating_the_client_stream() {
		let payload = Bytes::from_iter(std::iter::repeat(b'a').take(200));
		let (tee, rx) = CaptureBody::wrap(Body::from(payload.clone()), 50);
		let drained = drain(tee).await;
		// The client still gets every byte even though capture aborted.
		assert_eq!(drained, payload);
		match rx.await.unwrap() {
			CaptureOutcome::Overflowed => {},
			CaptureOutcome::Captured(_) => panic!("expected overflow"),
		}
	}

	#[tokio::test]
	async fn empty_body_captures_empty_bytes() {
		let (tee, rx) = CaptureBody::wrap(Body::empty(), 10);
		let drained = drain(tee).await;
		assert!(drained.is_empty());
		match rx.await.unwrap() {
			CaptureOutcome::Captured(b) => assert!(b.is_empty()),
			CaptureOutcome::Overflowed => panic!("expected a capture"),
		}
	}
}
