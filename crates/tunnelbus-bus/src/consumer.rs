//! Serial consumption of one queue

use crate::bus::DeliveryStream;
use crate::message::Delivery;
use futures::StreamExt;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Drive a delivery stream on its own task, one message at a time
///
/// Every delivery is acknowledged on receipt, before `handler` runs, so a
/// handler failure never causes redelivery. The next delivery is not pulled
/// until the handler future completes, which keeps the broker's FIFO order.
/// The loop ends when the stream ends or `cancel` fires.
pub fn spawn_serial_consumer<F, Fut>(
    queue: String,
    mut deliveries: DeliveryStream,
    cancel: CancellationToken,
    mut handler: F,
) -> JoinHandle<()>
where
    F: FnMut(Delivery) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        debug!(queue = %queue, "Consumer started");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!(queue = %queue, "Error receiving delivery: {}", e);
                    continue;
                }
                None => {
                    warn!(queue = %queue, "Delivery stream closed");
                    break;
                }
            };

            if let Err(e) = delivery.ack().await {
                warn!(queue = %queue, "Failed to acknowledge delivery: {}", e);
            }

            handler(delivery).await;
        }

        debug!(queue = %queue, "Consumer stopped");
    })
}
