pub mod broadcast;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod game;
pub mod game_client;
pub mod packet;
pub mod registry;
pub mod schema;
pub mod session;
pub mod visibility;
