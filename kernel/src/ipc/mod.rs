//! Message ports
//!
//! The request/response transport between the kernel's VFS and the
//! user-mode filesystem servers. See [`msgport`].

pub mod msgport;

pub use msgport::{IoOp, IoReply, MsgPortTable, NodeAttr, PortId, ReqId};
