use std::fmt;

use util::BinaryRead;
use {Error, MUS_TICK_RATE};

pub const MUS_MAGIC: &'static [u8; 4] = b"MUS\x1a";

const HEADER_SIZE: usize = 16;

const EVENT_RELEASE_NOTE: u8 = 0x00;
const EVENT_PLAY_NOTE: u8 = 0x10;
const EVENT_PITCH_BEND: u8 = 0x20;
const EVENT_SYSTEM: u8 = 0x30;
const EVENT_CONTROLLER: u8 = 0x40;
const EVENT_END_OF_SCORE: u8 = 0x60;

/// A decoded MUS event. Channels are already remapped to the internal
/// numbering (MUS percussion channel 15 becomes 9 and vice versa; channel
/// 9 is renumbered, not reserved).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    ReleaseNote { channel: u8, note: u8 },
    PlayNote    { channel: u8, note: u8, velocity: Option<u8> },
    PitchBend   { channel: u8, value: u8 },
    System      { channel: u8, code: u8 },
    Controller  { channel: u8, ctrl: u8, value: u8 },
    EndOfScore,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Event::ReleaseNote { channel, note } => {
                write!(f, "release     ch={:2} note={}", channel, note)
            },
            Event::PlayNote { channel, note, velocity } => {
                match velocity {
                    Some(v) => write!(f, "play        ch={:2} note={} vel={}", channel, note, v),
                    None    => write!(f, "play        ch={:2} note={}", channel, note),
                }
            },
            Event::PitchBend { channel, value } => {
                write!(f, "pitch bend  ch={:2} value={}", channel, value)
            },
            Event::System { channel, code } => {
                write!(f, "system      ch={:2} code={}", channel, code)
            },
            Event::Controller { channel, ctrl, value } => {
                write!(f, "controller  ch={:2} ctrl={} value={}", channel, ctrl, value)
            },
            Event::EndOfScore => write!(f, "end of score"),
        }
    }
}

/// A validated MUS file
///
/// MUS is the MIDI-like score format designed by Paul Radek for DMX,
/// used by Doom and several other id Software titles. Events carry a
/// 4-bit channel and an optional variable-length delay in 140 Hz ticks.
/// Holds a borrowed view of the score region; the caller keeps the bytes
/// alive for as long as the score is in use.
#[derive(Debug, Clone, Copy)]
pub struct MusScore<'a> {
    score           : &'a [u8],
    pub channels    : u16,
    pub sec_channels: u16,
    pub instr_count : u16,
}

impl<'a> MusScore<'a> {
    pub fn load(b: &'a [u8]) -> Result<MusScore<'a>, Error> {
        if b.slice(0, 4)? != MUS_MAGIC {
            return Err(Error::InvalidData("bad MUS magic".to_owned()));
        }

        let score_len = b.read16l(4)? as usize;
        let score_start = b.read16l(6)? as usize;
        if b.len() < HEADER_SIZE {
            return Err(Error::InvalidData("truncated MUS header".to_owned()));
        }

        Ok(MusScore {
            score       : b.slice(score_start, score_len)?,
            channels    : b.read16l(8)?,
            sec_channels: b.read16l(10)?,
            instr_count : b.read16l(12)?,
        })
    }

    pub fn score_len(&self) -> usize {
        self.score.len()
    }

    pub fn reader(&self) -> ScoreReader<'a> {
        ScoreReader {
            score: self.score,
            pos  : 0,
        }
    }

    /// Total score duration obtained by pre-scanning the delay ticks of a
    /// single pass. Stops early on a malformed event, mirroring playback.
    pub fn duration_ms(&self) -> u32 {
        let mut reader = self.reader();
        let mut ticks: u64 = 0;

        loop {
            match reader.next_event() {
                Ok((Event::EndOfScore, _)) | Err(_) => break,
                Ok((_, delay)) => ticks += delay as u64,
            }
        }

        (ticks * 1000 / MUS_TICK_RATE as u64) as u32
    }
}

/// Cursor over the event stream of a [`MusScore`].
#[derive(Debug, Clone, Copy)]
pub struct ScoreReader<'a> {
    score: &'a [u8],
    pos  : usize,
}

impl<'a> ScoreReader<'a> {
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Decode the next event and the delay (in 140 Hz ticks) that follows
    /// it. The delay applies after the event; End-Of-Score never carries
    /// one. Truncated payloads and the unassigned event types are errors,
    /// which playback treats as end of score.
    pub fn next_event(&mut self) -> Result<(Event, u32), Error> {
        let mut pos = self.pos;
        let event = self.read8(&mut pos)?;
        let channel = remap_channel(event & 0x0f);

        let decoded = match event & 0x70 {
            EVENT_RELEASE_NOTE => {
                let note = self.read8(&mut pos)?;
                Event::ReleaseNote { channel, note }
            },
            EVENT_PLAY_NOTE => {
                let data = self.read8(&mut pos)?;
                let velocity = if data & 0x80 != 0 {
                    Some(self.read8(&mut pos)? & 0x7f)
                } else {
                    None
                };
                Event::PlayNote { channel, note: data & 0x7f, velocity }
            },
            EVENT_PITCH_BEND => {
                let value = self.read8(&mut pos)?;
                Event::PitchBend { channel, value }
            },
            EVENT_SYSTEM => {
                let code = self.read8(&mut pos)?;
                Event::System { channel, code }
            },
            EVENT_CONTROLLER => {
                let ctrl = self.read8(&mut pos)?;
                let value = self.read8(&mut pos)?;
                Event::Controller { channel, ctrl, value }
            },
            EVENT_END_OF_SCORE => {
                self.pos = pos;
                return Ok((Event::EndOfScore, 0));
            },
            t => {
                return Err(Error::InvalidData(format!("unknown MUS event type {:#04x}", t)));
            },
        };

        let delay = if event & 0x80 != 0 {
            self.read_delay(&mut pos)?
        } else {
            0
        };

        self.pos = pos;
        Ok((decoded, delay))
    }

    fn read8(&self, pos: &mut usize) -> Result<u8, Error> {
        let b = self.score.read8(*pos)?;
        *pos += 1;
        Ok(b)
    }

    // Variable-length delay: 7 bits per byte, high bit set on continuation.
    fn read_delay(&self, pos: &mut usize) -> Result<u32, Error> {
        let mut value: u64 = 0;

        loop {
            let byte = self.read8(pos)?;
            value = (value << 7) | (byte & 0x7f) as u64;
            if value > u32::max_value() as u64 {
                return Err(Error::InvalidData("event delay overflow".to_owned()));
            }
            if byte & 0x80 == 0 {
                break;
            }
        }

        Ok(value as u32)
    }
}

fn remap_channel(channel: u8) -> u8 {
    match channel {
        15 => 9,
        9  => 15,
        c  => c,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mus(score: &[u8]) -> Vec<u8> {
        let mut b = MUS_MAGIC.to_vec();
        b.push(score.len() as u8);
        b.push((score.len() >> 8) as u8);
        b.push(HEADER_SIZE as u8);   // score_start
        b.push(0);
        b.extend_from_slice(&[2, 0, 0, 0, 1, 0, 0, 0]);
        b.extend_from_slice(score);
        b
    }

    fn read_all(data: &[u8]) -> Vec<(Event, u32)> {
        let score = MusScore::load(data).unwrap();
        let mut reader = score.reader();
        let mut out = Vec::new();
        loop {
            let (event, delay) = reader.next_event().unwrap();
            let done = event == Event::EndOfScore;
            out.push((event, delay));
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn test_header() {
        let data = mus(&[0x60]);
        let score = MusScore::load(&data).unwrap();
        assert_eq!(score.score_len(), 1);
        assert_eq!(score.channels, 2);
        assert_eq!(score.instr_count, 1);
    }

    #[test]
    fn test_bad_magic() {
        let mut data = mus(&[0x60]);
        data[3] = 0;
        assert!(MusScore::load(&data).is_err());
    }

    #[test]
    fn test_truncated() {
        let data = mus(&[0x60]);
        assert!(MusScore::load(&data[..10]).is_err());
        // score region extending past the buffer
        let mut data = mus(&[0x60]);
        data[4] = 200;
        assert!(MusScore::load(&data).is_err());
    }

    #[test]
    fn test_play_note() {
        // play note 60 with velocity, then without, then end
        let data = mus(&[0x10, 0x80 | 60, 100, 0x10, 61, 0x60]);
        let events = read_all(&data);
        assert_eq!(events[0].0, Event::PlayNote { channel: 0, note: 60, velocity: Some(100) });
        assert_eq!(events[1].0, Event::PlayNote { channel: 0, note: 61, velocity: None });
        assert_eq!(events[2].0, Event::EndOfScore);
    }

    #[test]
    fn test_release_note() {
        let data = mus(&[0x02, 48, 0x60]);
        let events = read_all(&data);
        assert_eq!(events[0].0, Event::ReleaseNote { channel: 2, note: 48 });
    }

    #[test]
    fn test_channel_remap() {
        let data = mus(&[0x1f, 35, 0x19, 35, 0x60]);
        let events = read_all(&data);
        assert_eq!(events[0].0, Event::PlayNote { channel: 9, note: 35, velocity: None });
        assert_eq!(events[1].0, Event::PlayNote { channel: 15, note: 35, velocity: None });
    }

    #[test]
    fn test_pitch_bend_and_controller() {
        let data = mus(&[0x24, 128, 0x44, 3, 90, 0x34, 11, 0x60]);
        let events = read_all(&data);
        assert_eq!(events[0].0, Event::PitchBend { channel: 4, value: 128 });
        assert_eq!(events[1].0, Event::Controller { channel: 4, ctrl: 3, value: 90 });
        assert_eq!(events[2].0, Event::System { channel: 4, code: 11 });
    }

    #[test]
    fn test_delay() {
        // one-byte and two-byte delays: 0x82 0x05 -> (2 << 7) | 5 = 261
        let data = mus(&[0x90, 0x80 | 60, 70, 0x82, 0x05, 0x00, 40, 0x60]);
        let score = MusScore::load(&data).unwrap();
        let mut reader = score.reader();
        let (event, delay) = reader.next_event().unwrap();
        assert_eq!(event, Event::PlayNote { channel: 0, note: 60, velocity: Some(70) });
        assert_eq!(delay, 261);
        let (event, delay) = reader.next_event().unwrap();
        assert_eq!(event, Event::ReleaseNote { channel: 0, note: 40 });
        assert_eq!(delay, 0);
    }

    #[test]
    fn test_unknown_type() {
        let data = mus(&[0x50, 0, 0x60]);
        let score = MusScore::load(&data).unwrap();
        assert!(score.reader().next_event().is_err());
    }

    #[test]
    fn test_truncated_event() {
        let data = mus(&[0x10]);
        let score = MusScore::load(&data).unwrap();
        let mut reader = score.reader();
        assert!(reader.next_event().is_err());
    }

    #[test]
    fn test_end_without_delay() {
        // the end marker has its delay bit set; no delay bytes follow
        let data = mus(&[0xe0]);
        let score = MusScore::load(&data).unwrap();
        assert_eq!(score.reader().next_event().unwrap(), (Event::EndOfScore, 0));
    }

    #[test]
    fn test_duration() {
        // 140 ticks of delay -> exactly one second
        let data = mus(&[0x90, 60, 0x81, 0x0c, 0x00, 60, 0x60]);
        let score = MusScore::load(&data).unwrap();
        assert_eq!(score.duration_ms(), 1000);
    }
}
