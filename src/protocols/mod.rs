//! Concrete `ProtocolOps` implementations. Real protocol parsers (MySQL
//! client/backend) are out of scope; `echo` is the one registered here,
//! sufficient to exercise every DCB operation without parsing a wire
//! protocol.

pub mod echo;
