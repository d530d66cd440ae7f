pub mod server;

pub use server::KvServer;
