pub mod channel;
pub mod clock;
pub mod config;
pub mod index;
pub mod ingest;
pub mod packet;
pub mod stream;
