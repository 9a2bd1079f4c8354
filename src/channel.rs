//! Lock-free publish/subscribe channel between loops.
//!
//! Each [`Subscriber`] owns a bounded single-producer/single-consumer ring
//! buffer, allocated once at construction. The producer side is a
//! [`SubscriberWriter`] that can be taken from the subscriber exactly once,
//! so the single-writer contract holds at the type level: a [`Publisher`]
//! that acquired the writer is the only party that can ever push into that
//! buffer, and the subscriber keeps the only reading half.
//!
//! Writes and reads never block. A full buffer drops the message and
//! reports `false`; there is no backpressure beyond that boolean. FIFO
//! order holds per subscriber, with no ordering across subscribers.

use crate::expect;
use crate::loops::LoopWaker;
use ringbuf::consumer::Consumer;
use ringbuf::producer::Producer;
use ringbuf::traits::Split;
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;

/// Producer half of a subscriber's ring buffer.
///
/// Held by at most one [`Publisher`] at a time. Dropping it permanently
/// closes the write side.
pub struct SubscriberWriter<T> {
    name: String,
    prod: HeapProd<T>,
    waker: Option<Arc<dyn LoopWaker>>,
}

impl<T> SubscriberWriter<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Push a message without blocking. Returns false and drops the message
    /// when the buffer is full. On success, wakes the attached loop (if any)
    /// so it consumes the data promptly.
    pub fn write(&mut self, message: T) -> bool {
        if self.prod.try_push(message).is_err() {
            return false;
        }
        if let Some(waker) = &self.waker {
            waker.wake();
        }
        true
    }
}

/// Consumer half of the channel, owned by the receiving side.
pub struct Subscriber<T> {
    name: String,
    cons: HeapCons<T>,
    writer: Option<SubscriberWriter<T>>,
}

impl<T> Subscriber<T> {
    /// A subscriber with a fixed-capacity buffer and no loop to wake.
    pub fn new(name: &str, capacity: usize) -> Self {
        Self::build(name, capacity, None)
    }

    /// Like [`Subscriber::new`], waking `waker` whenever a message lands.
    pub fn with_waker(name: &str, capacity: usize, waker: Arc<dyn LoopWaker>) -> Self {
        Self::build(name, capacity, Some(waker))
    }

    fn build(name: &str, capacity: usize, waker: Option<Arc<dyn LoopWaker>>) -> Self {
        expect!(!name.is_empty(), "subscriber needs to be named");
        expect!(capacity > 0, "subscriber buffer needs capacity");

        // The only allocation this channel ever performs.
        let (prod, cons) = HeapRb::new(capacity).split();
        Self {
            name: name.to_string(),
            cons,
            writer: Some(SubscriberWriter {
                name: name.to_string(),
                prod,
                waker,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pop the oldest buffered message without blocking; `None` when empty.
    pub fn read(&mut self) -> Option<T> {
        self.cons.try_pop()
    }

    /// Hand out the producer half. Yields `Some` exactly once.
    pub fn take_writer(&mut self) -> Option<SubscriberWriter<T>> {
        self.writer.take()
    }
}

/// Fans messages out to a set of uniquely named subscribers.
pub struct Publisher<T> {
    name: String,
    subscribers: Vec<SubscriberWriter<T>>,
}

impl<T> Publisher<T> {
    pub fn new(name: &str) -> Self {
        expect!(!name.is_empty(), "publisher needs to be named");
        Self {
            name: name.to_string(),
            subscribers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Acquire `subscriber`'s writer. Returns false, leaving the subscriber
    /// untouched, when the writer is already taken or a subscriber with the
    /// same name is registered; registration order is preserved.
    pub fn subscribe(&mut self, subscriber: &mut Subscriber<T>) -> bool {
        let Some(writer) = subscriber.take_writer() else {
            return false;
        };
        if writer.name().is_empty()
            || self.subscribers.iter().any(|s| s.name == writer.name)
        {
            subscriber.writer = Some(writer);
            return false;
        }
        self.subscribers.push(writer);
        true
    }
}

impl<T: Clone> Publisher<T> {
    /// Deliver `message` to every subscriber. Returns true only when every
    /// delivery succeeded; a full subscriber makes the aggregate false but
    /// the remaining subscribers still receive the message (partial
    /// delivery, no rollback).
    pub fn write(&mut self, message: &T) -> bool {
        let mut delivered = true;
        for subscriber in &mut self.subscribers {
            delivered &= subscriber.write(message.clone());
        }
        delivered
    }
}
