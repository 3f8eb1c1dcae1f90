//! The loop that turns gateway frames into handler calls.

use std::sync::Arc;

use bytes::Bytes;
use chatwire_core::{Codec, Event, Handler};
use futures::{StreamExt, stream::BoxStream};
use tokio_util::sync::CancellationToken;

/// Decode every frame from `frames` and publish its payload to `handler`, in
/// order. `done` is cancelled once the stream has ended and been dropped.
pub(crate) async fn run(
    mut frames: BoxStream<'static, Bytes>,
    codec: Codec,
    handler: Arc<Handler>,
    done: CancellationToken,
) {
    // Fires on return and on unwind.
    let _done = done.drop_guard();
    let mut buf = codec.new_buffer();

    while let Some(frame) = frames.next().await {
        let op = codec.decode_frame(&frame, &mut buf);

        if let Event::BackgroundError(ev) = &op.payload {
            tracing::warn!(error = %ev.error, "Gateway frame could not be decoded");
        } else {
            tracing::trace!(op = op.code, event = %op.event_type, seq = ?op.sequence, "Gateway event");
        }

        handler.call(&op.payload);
    }

    drop(frames);
    tracing::debug!("Gateway event stream ended");
}
