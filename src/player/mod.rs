pub mod dmx;

pub use self::dmx::DmxPlayer;

use format::{InstrumentBank, MusScore, ScoreReader};
use format::mus::Event;
use opl::OplChip;
use {Error, MAX_RATE, MIN_RATE, MUS_TICK_RATE};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OplType {
    Opl2,
    Opl3,
}

/// Doom release whose OPL driver behavior is emulated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DoomVersion {
    Doom1_1_666,
    Doom2_1_666,
    Doom1_9,
}

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub sample_rate   : u32,
    pub opl_type      : OplType,
    pub doom_version  : DoomVersion,
    pub initial_volume: u8,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            sample_rate   : 44100,
            opl_type      : OplType::Opl3,
            doom_version  : DoomVersion::Doom1_9,
            initial_volume: 100,
        }
    }
}

/// A MUS player bound to a chip emulator.
///
/// The player borrows the MUS bytes for its lifetime and pulls stereo
/// 16-bit frames out of the chip while dispatching score events on a
/// sample-accurate 140 Hz clock. All operations are single-threaded and
/// run to completion; a caller rendering from an audio callback owns the
/// player on that thread.
pub struct Player<'a, C: OplChip> {
    chip  : C,
    opts  : Options,
    dmx   : DmxPlayer,
    bank  : Option<InstrumentBank>,
    score : Option<MusScore<'a>>,
    reader: Option<ScoreReader<'a>>,
    volume: u8,

    playing: bool,
    paused : bool,
    looping: bool,

    current_sample   : u64,
    next_event_sample: u64,
    timing_remainder : u64,
}

impl<'a, C: OplChip> Player<'a, C> {
    pub fn new(mut chip: C, options: Options) -> Result<Self, Error> {
        if options.sample_rate < MIN_RATE || options.sample_rate > MAX_RATE {
            return Err(Error::InvalidParam(format!("sample rate {} out of range",
                       options.sample_rate)));
        }
        if options.initial_volume > 127 {
            return Err(Error::InvalidParam(format!("initial volume {} out of range",
                       options.initial_volume)));
        }

        chip.reset(options.sample_rate);

        let mut dmx = DmxPlayer::new(options.opl_type == OplType::Opl3,
                                     options.initial_volume);
        dmx.init_registers(&mut chip);

        Ok(Player {
            chip,
            opts  : options,
            dmx,
            bank  : None,
            score : None,
            reader: None,
            volume: options.initial_volume,

            playing: false,
            paused : false,
            looping: false,

            current_sample   : 0,
            next_event_sample: 0,
            timing_remainder : 0,
        })
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Load a MUS score. The bytes stay borrowed until `unload` or a
    /// subsequent load. On error the previously loaded score is kept.
    pub fn load_mus(&mut self, data: &'a [u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::InvalidParam("empty MUS data".to_owned()));
        }

        let score = MusScore::load(data)?;
        debug!("loaded MUS score: {} score bytes, {} channels",
               score.score_len(), score.channels);

        self.reader = Some(score.reader());
        self.score = Some(score);
        self.playing = false;
        self.paused = false;
        self.current_sample = 0;
        self.next_event_sample = 0;
        self.timing_remainder = 0;

        Ok(())
    }

    /// Load a GENMIDI instrument bank. May be called during playback:
    /// new notes pick up the new bank, sounding voices finish on the
    /// patch they started with.
    pub fn load_genmidi(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::InvalidParam("empty GENMIDI data".to_owned()));
        }

        self.bank = Some(InstrumentBank::load(data)?);
        Ok(())
    }

    pub fn instruments_loaded(&self) -> bool {
        self.bank.is_some()
    }

    /// Begin playback from the start of the score.
    pub fn start(&mut self, looping: bool) -> Result<(), Error> {
        let score = match self.score {
            Some(s) => s,
            None    => return Err(Error::NotInitialized),
        };

        self.reader = Some(score.reader());
        self.looping = looping;
        self.playing = true;
        self.paused = false;
        self.current_sample = 0;
        self.next_event_sample = 0;
        self.timing_remainder = 0;

        Ok(())
    }

    pub fn stop(&mut self) {
        self.playing = false;
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_playing(&self) -> bool {
        self.playing && !self.paused
    }

    /// Master volume, 0-127; out-of-range values are clamped.
    pub fn set_volume(&mut self, volume: i32) {
        let mut volume = volume;
        clamp!(volume, 0, 127);

        self.volume = volume as u8;
        self.dmx.set_master_volume(&mut self.chip, self.volume);
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    /// Fill `buffer` with interleaved stereo frames. Returns the number
    /// of frames written (always `buffer.len() / 2`). While stopped or
    /// paused the buffer is zero-filled and the clock does not advance;
    /// after the score ends mid-buffer the chip keeps producing frames so
    /// envelope tails decay naturally.
    pub fn generate_samples(&mut self, buffer: &mut [i16]) -> usize {
        let frames = buffer.len() / 2;

        if !self.playing || self.paused {
            for s in buffer[..frames * 2].iter_mut() {
                *s = 0;
            }
            return frames;
        }

        for i in 0..frames {
            // dispatch everything due at this sample index
            let mut wrapped = 0;
            while self.playing && self.current_sample >= self.next_event_sample {
                if self.process_event() {
                    wrapped += 1;
                    if wrapped >= 2 {
                        warn!("score loops without advancing time");
                        break;
                    }
                }
            }

            let (l, r) = self.chip.generate();
            buffer[i * 2] = l;
            buffer[i * 2 + 1] = r;

            if self.playing {
                self.current_sample += 1;
            }
        }

        frames
    }

    pub fn position_ms(&self) -> u32 {
        (self.current_sample * 1000 / self.opts.sample_rate as u64) as u32
    }

    /// Score duration computed from the delay ticks of one pass.
    pub fn length_ms(&self) -> u32 {
        match self.score {
            Some(s) => s.duration_ms(),
            None    => 0,
        }
    }

    /// Approximate seek: playback restarts from the beginning of the
    /// score (FM state cannot be reconstructed mid-stream).
    pub fn seek_ms(&mut self, _position_ms: u32) -> Result<(), Error> {
        let looping = self.looping;
        self.stop();
        self.start(looping)
    }

    /// Drop the loaded score. The instrument bank stays loaded.
    pub fn unload(&mut self) {
        self.stop();
        self.score = None;
        self.reader = None;
    }

    // Process one event. Returns true when the score ended (and possibly
    // wrapped around for a looping player).
    fn process_event(&mut self) -> bool {
        let next = match self.reader {
            Some(ref mut r) => r.next_event(),
            None            => {
                self.playing = false;
                return true;
            },
        };

        match next {
            Ok((Event::EndOfScore, _)) => {
                self.end_of_score();
                true
            },
            Ok((event, delay)) => {
                self.dmx.handle_event(&mut self.chip, self.bank.as_ref(), &event);
                if delay > 0 {
                    self.advance_event_time(delay);
                }
                false
            },
            Err(e) => {
                warn!("malformed score: {}", e);
                self.end_of_score();
                true
            },
        }
    }

    fn end_of_score(&mut self) {
        if self.looping {
            if let Some(ref mut r) = self.reader {
                r.rewind();
            }
            self.current_sample = 0;
            self.next_event_sample = 0;
            self.timing_remainder = 0;
        } else {
            debug!("end of score after {} samples", self.current_sample);
            self.playing = false;
        }
    }

    // Advance the event clock by 140 Hz ticks, carrying the division
    // remainder so the conversion never drifts.
    fn advance_event_time(&mut self, delay_ticks: u32) {
        let accum = self.timing_remainder
                  + delay_ticks as u64 * self.opts.sample_rate as u64;
        self.next_event_sample += accum / MUS_TICK_RATE as u64;
        self.timing_remainder = accum % MUS_TICK_RATE as u64;
    }
}
