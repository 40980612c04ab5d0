//! The unit of data flow: an immutable, timestamped, type-erased value.
//!
//! A packet is shared by every consumer downstream of its producer. The
//! payload sits behind an `Arc` and is never mutated after publication, so
//! concurrent reads need no synchronization; "transforming" a packet means
//! producing a new one.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::error::PacketError;
use super::timestamp::Timestamp;
use super::types::TypeTag;

struct Payload {
    tag: TypeTag,
    value: Box<dyn Any + Send + Sync>,
}

/// `(timestamp, type, payload)` triple. Cheap to clone.
///
/// A packet without a payload is *empty*: it still carries a timestamp and
/// is used to advance stream bounds without data.
#[derive(Clone)]
pub struct Packet {
    timestamp: Timestamp,
    payload: Option<Arc<Payload>>,
}

impl Packet {
    /// Wrap a value, bound to `timestamp`.
    pub fn new<T: Send + Sync + 'static>(value: T, timestamp: Timestamp) -> Packet {
        Packet {
            timestamp,
            payload: Some(Arc::new(Payload {
                tag: TypeTag::of::<T>(),
                value: Box::new(value),
            })),
        }
    }

    /// A payload-less packet at `timestamp`.
    pub fn empty(timestamp: Timestamp) -> Packet {
        Packet {
            timestamp,
            payload: None,
        }
    }

    /// The same payload bound to a different timestamp.
    pub fn at(&self, timestamp: Timestamp) -> Packet {
        Packet {
            timestamp,
            payload: self.payload.clone(),
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_none()
    }

    /// Borrow the payload as `T`.
    pub fn value_as<T: Send + Sync + 'static>(&self) -> Result<&T, PacketError> {
        let payload = self.payload.as_ref().ok_or(PacketError::Empty {
            timestamp: self.timestamp,
        })?;
        payload
            .value
            .downcast_ref::<T>()
            .ok_or(PacketError::TypeMismatch {
                expected: TypeTag::of::<T>().name(),
                actual: payload.tag.name(),
            })
    }

    /// Runtime tag of the payload, if any.
    pub fn type_tag(&self) -> Option<TypeTag> {
        self.payload.as_ref().map(|p| p.tag)
    }

    pub fn type_name(&self) -> &'static str {
        self.payload.as_ref().map_or("<empty>", |p| p.tag.name())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet<{}>@{}", self.type_name(), self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_round_trips_through_erasure() {
        let packet = Packet::new(41i64, Timestamp::new(3));
        assert_eq!(*packet.value_as::<i64>().unwrap(), 41);
        assert_eq!(packet.timestamp(), Timestamp::new(3));
        assert!(!packet.is_empty());
    }

    #[test]
    fn wrong_type_is_reported_with_both_names() {
        let packet = Packet::new(String::from("frame"), Timestamp::new(1));
        let err = packet.value_as::<i64>().unwrap_err();
        match err {
            PacketError::TypeMismatch { expected, actual } => {
                assert!(expected.contains("i64"));
                assert!(actual.contains("String"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_packet_has_timestamp_but_no_value() {
        let packet = Packet::empty(Timestamp::new(9));
        assert!(packet.is_empty());
        assert_eq!(packet.timestamp(), Timestamp::new(9));
        assert_eq!(
            packet.value_as::<i64>().unwrap_err(),
            PacketError::Empty {
                timestamp: Timestamp::new(9)
            }
        );
    }

    #[test]
    fn rebinding_shares_the_payload() {
        let data = Arc::new(vec![1u8, 2, 3]);
        let packet = Packet::new(Arc::clone(&data), Timestamp::new(1));
        let rebound = packet.at(Timestamp::new(5));
        assert_eq!(rebound.timestamp(), Timestamp::new(5));
        assert_eq!(**rebound.value_as::<Arc<Vec<u8>>>().unwrap(), vec![1, 2, 3]);
        // original + packet + rebound share one allocation
        assert_eq!(Arc::strong_count(&data), 2);
        drop(packet);
        drop(rebound);
        assert_eq!(Arc::strong_count(&data), 1);
    }
}
