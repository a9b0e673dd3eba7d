//! Default implementations of [crate::node::Connector]

pub mod tcp;
