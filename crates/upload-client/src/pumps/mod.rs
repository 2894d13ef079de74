//! Background tasks driving one WebSocket client connection.

pub(crate) mod read;
pub(crate) mod write;
