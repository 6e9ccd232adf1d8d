use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;

pub struct EventConsumer<E>(Receiver<E>);

impl<E> From<Receiver<E>> for EventConsumer<E> {
    fn from(value: Receiver<E>) -> Self {
        Self(value)
    }
}

pub struct EventPublisher<E>(Sender<E>);

impl<E> From<Sender<E>> for EventPublisher<E> {
    fn from(value: Sender<E>) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum EventPublisherError {
    #[error("error while publishing event: {0}")]
    SendError(String),
}

/// Creates a bound publisher/consumer pair backed by an unbounded channel.
///
/// Every command inbox in this crate (Instance, Task, TaskMaster) is one of these pairs:
/// the owning component holds the [`EventConsumer`] and drains it in its run loop, callers
/// hold a cloned [`EventPublisher`].
pub fn pub_sub<E>() -> (EventPublisher<E>, EventConsumer<E>) {
    let (s, r) = unbounded();
    (EventPublisher(s), EventConsumer(r))
}

impl<E> EventPublisher<E> {
    pub fn publish(&self, event: E) -> Result<(), EventPublisherError> {
        self.0
            .send(event)
            .map_err(|err| EventPublisherError::SendError(err.to_string()))
    }

    pub fn try_publish(&self, event: E) -> Result<(), EventPublisherError> {
        self.0
            .try_send(event)
            .map_err(|err| EventPublisherError::SendError(err.to_string()))
    }
}

impl<E> Clone for EventPublisher<E> {
    fn clone(&self) -> Self {
        EventPublisher(self.0.clone())
    }
}

impl<E> AsRef<Receiver<E>> for EventConsumer<E> {
    fn as_ref(&self) -> &Receiver<E> {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_receive_in_order() {
        let (publisher, consumer) = pub_sub::<u32>();
        publisher.publish(1).unwrap();
        publisher.publish(2).unwrap();
        assert_eq!(consumer.as_ref().recv().unwrap(), 1);
        assert_eq!(consumer.as_ref().recv().unwrap(), 2);
    }

    #[test]
    fn publish_after_consumer_dropped_errors() {
        let (publisher, consumer) = pub_sub::<u32>();
        drop(consumer);
        assert!(publisher.publish(1).is_err());
    }
}
