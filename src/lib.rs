extern crate byteorder;
#[macro_use]
extern crate log;

#[macro_use]
mod util;

pub mod format;
pub mod opl;
pub mod player;

pub use opl::{NullChip, OplChip};
pub use player::{DoomVersion, Options, OplType, Player};

use std::error;
use std::fmt;
use std::io;

/// Rate of the MUS event clock, in ticks per second.
pub const MUS_TICK_RATE: u32 = 140;

pub const MAX_RATE: u32 = 96000;
pub const MIN_RATE: u32 = 4000;

/// Number of two-operator voices on an OPL3 (9 per register array).
pub const OPL_VOICES: usize = 18;

pub const MIDI_CHANNELS: usize = 16;

/// Channel used for percussion after MUS channel remapping.
pub const PERCUSSION_CHANNEL: usize = 9;

#[derive(Debug)]
pub enum Error {
    InvalidParam(String),
    InvalidData(String),
    NotInitialized,
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            &Error::InvalidParam(ref descr) => write!(f, "{}", descr),
            &Error::InvalidData(ref descr)  => write!(f, "{}", descr),
            &Error::NotInitialized          => write!(f, "no music loaded"),
            &Error::Io(ref err)             => write!(f, "{}", err),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(error::Error + 'static)> {
        match *self {
            Error::Io(ref err) => Some(err),
            _                  => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}
