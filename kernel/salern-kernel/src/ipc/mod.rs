//! Inter-process communication: UNIX sockets and the poll plumbing.

pub mod poll;
pub mod socket;
