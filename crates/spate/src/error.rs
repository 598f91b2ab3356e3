use std::io;

use thiserror::Error;

use crate::config::InstanceId;

/// Everything that can go wrong while setting up or running an instance.
///
/// Socket variants carry the underlying OS error. Errors surfaced after the
/// instance emitted `STARTED` never reach the caller of `start_instance`;
/// they drive the instance straight to `STOPPED` / `CLOSED` instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    #[error("not enough memory")]
    NoMemory,
    #[error("socket create failed")]
    SocketCreate(#[source] io::Error),
    #[error("socket bind failed")]
    SocketBind(#[source] io::Error),
    #[error("socket listen failed")]
    SocketListen(#[source] io::Error),
    #[error("socket accept failed")]
    SocketAccept(#[source] io::Error),
    #[error("socket connect failed")]
    SocketConnect(#[source] io::Error),
    #[error("socket io failed")]
    SocketIo(#[source] io::Error),
    #[error("timed out")]
    Timeout,
    #[error("instance id={0} not found")]
    InstanceNotFound(InstanceId),
    #[error("instance id={0} already in use")]
    InstanceExhausted(InstanceId),
    #[error("{0}")]
    Fatal(&'static str),
}
