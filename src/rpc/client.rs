//! A blocking connection to a `taskmaster-server` RPC listener.
use std::net::TcpStream;

use super::protocol::{read_frame, write_frame, Request, Response};
use crate::error::RpcError;

pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    pub fn connect(addr: &str) -> Result<Self, RpcError> {
        Ok(Self {
            stream: TcpStream::connect(addr)?,
        })
    }

    pub fn call(&mut self, request: Request) -> Result<Response, RpcError> {
        write_frame(&mut self.stream, &request)?;
        read_frame(&mut self.stream)
    }
}
