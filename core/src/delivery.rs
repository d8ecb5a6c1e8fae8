/// Delivery receipts: who may advance a message, and when
///
/// Status moves strictly forward through sent -> delivered -> read and is
/// only ever advanced by the receiving side; soft deletion belongs to the
/// sender alone. All produced patches target absolute states, so reissuing
/// one after a transient store failure is harmless.
use crate::error::{ChatError, Result};
use crate::types::{DeliveryStatus, Message, MessagePatch};
use chrono::{DateTime, Utc};

/// Patches flipping freshly visible incoming messages to `delivered`.
///
/// Issued from the receiver's live snapshot stream as soon as a message
/// addressed to `self_id` shows up still in `sent`. Messages sent by
/// `self_id`, or already past `sent`, produce nothing, so reprocessing the
/// same snapshot is a no-op.
pub fn acknowledge(messages: &[Message], self_id: &str) -> Vec<(String, MessagePatch)> {
    messages
        .iter()
        .filter(|m| m.receiver_id == self_id && m.status == DeliveryStatus::Sent)
        .map(|m| {
            (
                m.id.clone(),
                MessagePatch {
                    status: Some(DeliveryStatus::Delivered),
                    ..Default::default()
                },
            )
        })
        .collect()
}

/// Patches advancing rendered incoming messages to `read`, stamping the
/// read timestamp. Issued only once the conversation is actually on
/// screen, which is what distinguishes read from mere delivery.
pub fn mark_read(
    messages: &[Message],
    self_id: &str,
    now: DateTime<Utc>,
) -> Vec<(String, MessagePatch)> {
    messages
        .iter()
        .filter(|m| m.receiver_id == self_id && m.status != DeliveryStatus::Read)
        .map(|m| {
            (
                m.id.clone(),
                MessagePatch {
                    status: Some(DeliveryStatus::Read),
                    read_at: Some(now),
                    ..Default::default()
                },
            )
        })
        .collect()
}

/// Soft-delete patch for `message`. Only the original sender may delete.
/// The patch replaces the body with `placeholder`; the record, its
/// timestamps and its delivery status survive.
pub fn soft_delete(message: &Message, actor: &str, placeholder: &str) -> Result<MessagePatch> {
    if message.sender_id != actor {
        return Err(ChatError::Forbidden(format!(
            "only the sender may delete message {}",
            message.id
        )));
    }
    Ok(MessagePatch {
        delete_with_placeholder: Some(placeholder.to_string()),
        ..Default::default()
    })
}
