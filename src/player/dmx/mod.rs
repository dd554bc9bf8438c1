mod player;
mod tables;

pub use self::player::DmxPlayer;
