use util::BinaryRead;
use Error;

pub const GENMIDI_MAGIC: &'static [u8; 8] = b"#OPL_II#";

pub const NUM_MELODIC: usize = 128;
pub const NUM_PERCUSSION: usize = 47;

/// Instrument plays its fixed note regardless of the MIDI key.
pub const FLAG_FIXED: u16 = 0x0001;
/// Instrument allocates two hardware voices per note.
pub const FLAG_DOUBLE_VOICE: u16 = 0x0004;

const RECORD_SIZE: usize = 36;
const VOICE_SIZE: usize = 16;

/// The six per-operator OPL parameter bytes of a GENMIDI record.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpData {
    pub tremolo : u8,   // tremolo / vibrato / sustain / KSR / multiplier
    pub attack  : u8,   // attack rate / decay rate
    pub sustain : u8,   // sustain level / release rate
    pub waveform: u8,
    pub scale   : u8,   // key scale level
    pub level   : u8,   // output level
}

impl OpData {
    fn from_slice(b: &[u8]) -> Self {
        OpData {
            tremolo : b[0],
            attack  : b[1],
            sustain : b[2],
            waveform: b[3],
            scale   : b[4],
            level   : b[5],
        }
    }
}

/// One of the two FM voice patches of an instrument.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatchVoice {
    pub modulator       : OpData,
    pub feedback        : u8,    // feedback/connection; bit 0 selects additive mode
    pub carrier         : OpData,
    pub base_note_offset: i16,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Instrument {
    pub flags      : u16,
    pub fine_tuning: u8,   // 128 is neutral
    pub fixed_note : u8,
    pub voices     : [PatchVoice; 2],
}

impl Instrument {
    pub fn is_fixed(&self) -> bool {
        self.flags & FLAG_FIXED != 0
    }

    pub fn is_double_voice(&self) -> bool {
        self.flags & FLAG_DOUBLE_VOICE != 0
    }

    fn from_slice(b: &[u8]) -> Result<Self, Error> {
        Ok(Instrument {
            flags      : b.read16l(0)?,
            fine_tuning: b.read8(2)?,
            fixed_note : b.read8(3)?,
            voices     : [
                load_voice(b.slice(4, VOICE_SIZE)?)?,
                load_voice(b.slice(4 + VOICE_SIZE, VOICE_SIZE)?)?,
            ],
        })
    }
}

// Voice record layout: modulator (6 bytes), feedback, carrier (6 bytes),
// one unused byte, base note offset (i16 LE).
fn load_voice(b: &[u8]) -> Result<PatchVoice, Error> {
    Ok(PatchVoice {
        modulator       : OpData::from_slice(b.slice(0, 6)?),
        feedback        : b.read8(6)?,
        carrier         : OpData::from_slice(b.slice(7, 6)?),
        base_note_offset: b.read16li(14)?,
    })
}

/// GENMIDI instrument bank
///
/// The GENMIDI lump from a Doom WAD describes how each General MIDI
/// program maps to OPL operator settings: 128 melodic instruments
/// followed by 47 percussion instruments, each a fixed 36-byte record.
/// The bank is frozen once loaded.
#[derive(Debug)]
pub struct InstrumentBank {
    pub melodic   : Vec<Instrument>,
    pub percussion: Vec<Instrument>,
}

impl InstrumentBank {
    pub fn load(b: &[u8]) -> Result<Self, Error> {
        if b.slice(0, 8)? != GENMIDI_MAGIC {
            return Err(Error::InvalidData("bad GENMIDI magic".to_owned()));
        }

        let mut melodic = Vec::with_capacity(NUM_MELODIC);
        let mut percussion = Vec::with_capacity(NUM_PERCUSSION);

        for i in 0..NUM_MELODIC + NUM_PERCUSSION {
            let rec = Instrument::from_slice(b.slice(8 + i * RECORD_SIZE, RECORD_SIZE)?)?;
            if i < NUM_MELODIC {
                melodic.push(rec);
            } else {
                percussion.push(rec);
            }
        }

        debug!("loaded GENMIDI bank: {} melodic, {} percussion", melodic.len(), percussion.len());

        Ok(InstrumentBank { melodic, percussion })
    }
}
