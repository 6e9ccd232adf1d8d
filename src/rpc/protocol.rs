//! Wire types and framing for the `Runner` RPC surface: a 4-byte big-endian length
//! prefix followed by a JSON body, in either direction.
use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// A task name plus the instance ids addressed; an empty `instances` means "all replicas".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(default)]
    pub instances: Vec<u32>,
}

impl Target {
    pub fn new(name: impl Into<String>, instances: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            instances,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "payload", rename_all = "snake_case")]
pub enum Request {
    Start(Target),
    Stop(Target),
    Restart(Target),
    Status(Target),
    List,
    Reload,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok { message: String },
    Names { names: Vec<String> },
    Error { message: String },
}

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), RpcError> {
    let body = serde_json::to_vec(value)?;
    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, RpcError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}
