pub mod genmidi;
pub mod mus;

pub use self::genmidi::{Instrument, InstrumentBank, OpData, PatchVoice};
pub use self::mus::{Event, MusScore, ScoreReader};
