use crate::frame::frame_errors::ParseError;
use crate::frame::response::result::SchemaChangeType;
use crate::frame::server_event_type::EventType;
use crate::frame::types;
use std::net::SocketAddr;

/// A server-pushed event, delivered on the reserved event stream of a
/// connection that REGISTERed for it.
#[derive(Debug, Clone)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug, Clone)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
}

#[derive(Debug, Clone)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

#[derive(Debug, Clone)]
pub struct SchemaChangeEvent {
    pub change_type: SchemaChangeType,
    pub keyspace: String,
    /// Empty when the change concerns the keyspace itself.
    pub table: String,
}

impl Event {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let event_type: EventType = types::read_string(buf)?.parse()?;
        match event_type {
            EventType::TopologyChange => {
                Ok(Self::TopologyChange(TopologyChangeEvent::deserialize(buf)?))
            }
            EventType::StatusChange => Ok(Self::StatusChange(StatusChangeEvent::deserialize(buf)?)),
            EventType::SchemaChange => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(buf)?)),
        }
    }
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = types::read_string(buf)?.to_string();
        let addr = types::read_inet(buf)?;

        match type_of_change.as_str() {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            _ => Err(ParseError::UnknownChangeType(type_of_change)),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = types::read_string(buf)?.to_string();
        let addr = types::read_inet(buf)?;

        match type_of_change.as_str() {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ParseError::UnknownChangeType(type_of_change)),
        }
    }
}

impl SchemaChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let change_type = types::read_string(buf)?.into();
        let keyspace = types::read_string(buf)?.to_string();
        let table = types::read_string(buf)?.to_string();

        Ok(SchemaChangeEvent {
            change_type,
            keyspace,
            table,
        })
    }
}
