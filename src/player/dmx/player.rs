use format::genmidi::{Instrument, InstrumentBank, OpData, FLAG_DOUBLE_VOICE, FLAG_FIXED};
use format::mus::Event;
use opl::{OplChip, RegisterFile, VOICE_OPERATORS};
use opl::{REG_ATTACK, REG_FEEDBACK, REG_FREQ_HI, REG_FREQ_LO, REG_LEVEL, REG_OPL3_ENABLE,
          REG_SUSTAIN, REG_TEST, REG_TIMER_CTRL, REG_TREMOLO, REG_WAVEFORM};
use player::dmx::tables::{FREQUENCY_CURVE, VOLUME_MAPPING};
use {MIDI_CHANNELS, OPL_VOICES, PERCUSSION_CHANNEL};

/// Identity of the patch loaded into a hardware voice, used to skip
/// reprogramming when a voice is reused with the same instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
enum PatchSource {
    Melodic(u8),
    Percussion(u8),
}

#[derive(Debug, Clone, Copy)]
struct Channel {
    program      : u8,
    volume       : u8,    // effective volume, capped by the master volume
    volume_base  : u8,    // last value received from the score
    pan_reg      : u8,    // 0x10 right, 0x20 left, 0x30 center
    bend         : i16,   // 1/32 semitone units
    last_velocity: u8,
}

impl Channel {
    fn new(master_volume: u8) -> Self {
        Channel {
            program      : 0,
            volume       : if master_volume < 100 { master_volume } else { 100 },
            volume_base  : 100,
            pan_reg      : 0x30,
            bend         : 0,
            last_velocity: 127,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Voice {
    index      : usize,            // 0-8 within its register array
    op1        : u16,
    op2        : u16,
    array      : u16,              // 0x000 or 0x100
    in_use     : bool,
    channel    : Option<usize>,
    instr      : Instrument,       // inline copy of the sounding patch
    instr_voice: usize,            // 0 or 1 within the instrument
    loaded     : Option<(PatchSource, usize)>,
    key        : u8,               // MIDI key that matches the note-off
    note       : u8,               // note used for the frequency, may differ
    freq       : u16,              // shadow of the A0/B0 register pair
    car_level  : u8,               // shadow of the carrier level register
    mod_level  : u8,               // shadow of the modulator level register
    reg_pan    : u8,
    note_volume: u8,
}

impl Voice {
    fn new() -> Self {
        Voice {
            index      : 0,
            op1        : 0,
            op2        : 0,
            array      : 0,
            in_use     : false,
            channel    : None,
            instr      : Instrument::default(),
            instr_voice: 0,
            loaded     : None,
            key        : 0,
            note       : 0,
            freq       : 0,
            car_level  : 0,
            mod_level  : 0,
            reg_pan    : 0x30,
            note_volume: 0,
        }
    }
}

/// DMX OPL replayer
///
/// A replayer based on the OPL music playback routines of the DMX sound
/// library written by Paul Radek for id Software's Doom, following the
/// register-level reconstruction in Chocolate Doom's i_oplmusic.c. The
/// GENMIDI patch loading order, voice stealing policy and volume/frequency
/// arithmetic reproduce what the DOS driver sent to the chip.
///
/// Notes:
/// * Voices refer to their owning channel by index; releasing a channel
///   scans the 18-voice pool rather than chasing back-pointers.
/// * The replayer never owns the chip: every method that programs
///   registers takes it as a parameter.
pub struct DmxPlayer {
    channels    : [Channel; MIDI_CHANNELS],
    voices      : [Voice; OPL_VOICES],
    regs        : RegisterFile,
    num_voices  : usize,
    opl3        : bool,
    music_volume: u8,
}

impl DmxPlayer {
    pub fn new(opl3: bool, music_volume: u8) -> Self {
        let mut voices = [Voice::new(); OPL_VOICES];
        for i in 0..OPL_VOICES {
            voices[i].index = i % 9;
            voices[i].op1 = VOICE_OPERATORS[0][i % 9];
            voices[i].op2 = VOICE_OPERATORS[1][i % 9];
            voices[i].array = ((i / 9) << 8) as u16;
        }

        DmxPlayer {
            channels: [Channel::new(music_volume); MIDI_CHANNELS],
            voices,
            regs: RegisterFile::new(),
            num_voices: if opl3 { OPL_VOICES } else { 9 },
            opl3,
            music_volume,
        }
    }

    /// Program the chip into the state DMX left it in after startup:
    /// all levels muted, envelopes cleared, timers reset, waveform select
    /// enabled, and (on OPL3) the second array brought up the same way.
    pub fn init_registers<C: OplChip>(&mut self, chip: &mut C) {
        self.init_array(chip, 0x000);

        // Reset both timers and enable interrupts
        self.regs.write(chip, REG_TIMER_CTRL, 0x60);
        self.regs.write(chip, REG_TIMER_CTRL, 0x80);

        // "Allow FM chips to control the waveform of each operator"
        self.regs.write(chip, REG_TEST, 0x20);

        if self.opl3 {
            self.regs.write(chip, REG_OPL3_ENABLE, 0x01);
            self.init_array(chip, 0x100);
        }
    }

    fn init_array<C: OplChip>(&mut self, chip: &mut C, array: u16) {
        for r in REG_LEVEL..REG_LEVEL + 0x16 {
            self.regs.write(chip, r | array, 0x3f);
        }
        for r in REG_ATTACK..REG_WAVEFORM + 0x16 {
            self.regs.write(chip, r | array, 0x00);
        }
        for r in 1..REG_LEVEL {
            self.regs.write(chip, r | array, 0x00);
        }
    }

    /// Apply one score event. `bank` is the loaded instrument bank, if
    /// any; note events are ignored until one is present.
    pub fn handle_event<C: OplChip>(&mut self, chip: &mut C, bank: Option<&InstrumentBank>,
                                    event: &Event) {
        match *event {
            Event::ReleaseNote { channel, note } => {
                self.note_off(chip, channel as usize, note);
            },
            Event::PlayNote { channel, note, velocity } => {
                self.play_note(chip, bank, channel as usize, note, velocity);
            },
            Event::PitchBend { channel, value } => {
                let ch = channel as usize;
                self.channels[ch].bend = (value as i16 - 128) / 2;

                // force the frequency registers to be rewritten
                for v in 0..self.num_voices {
                    if self.voices[v].in_use && self.voices[v].channel == Some(ch) {
                        self.voices[v].freq = 0;
                        self.update_voice_frequency(chip, v);
                    }
                }
            },
            Event::System { channel, code } => {
                let ch = channel as usize;
                match code {
                    10 | 11 => self.release_all_for(chip, ch),
                    14      => self.reset_controllers(chip, ch),
                    _       => {},
                }
            },
            Event::Controller { channel, ctrl, value } => {
                let ch = channel as usize;
                match ctrl {
                    0       => self.channels[ch].program = value & 0x7f,
                    3       => self.set_channel_volume(chip, ch, value),
                    4       => self.set_channel_pan(chip, ch, value),
                    10 | 11 => self.release_all_for(chip, ch),
                    14      => self.reset_controllers(chip, ch),
                    _       => {},
                }
            },
            Event::EndOfScore => {},   // handled by the scheduler
        }
    }

    fn play_note<C: OplChip>(&mut self, chip: &mut C, bank: Option<&InstrumentBank>,
                             ch: usize, note: u8, velocity: Option<u8>) {
        if let Some(v) = velocity {
            self.channels[ch].last_velocity = v;
        }
        let velocity = self.channels[ch].last_velocity;

        // a note-on at volume zero is a release
        if velocity == 0 {
            self.note_off(chip, ch, note);
            return;
        }

        let bank = try_option!(bank);

        let (source, instr, freq_note) = if ch == PERCUSSION_CHANNEL {
            // percussion instruments are selected by key, starting at the
            // kick drum on key 35; DMX computes their frequency from note
            // 60 unless the patch is fixed-pitch
            let idx = note.wrapping_sub(35);
            if (idx as usize) < bank.percussion.len() {
                (PatchSource::Percussion(idx), bank.percussion[idx as usize], 60)
            } else {
                (PatchSource::Melodic(0), bank.melodic[0], 60)
            }
        } else {
            let program = self.channels[ch].program;
            (PatchSource::Melodic(program), bank.melodic[program as usize], note)
        };

        self.note_on(chip, ch, source, instr, freq_note, note, velocity);
    }

    fn note_on<C: OplChip>(&mut self, chip: &mut C, ch: usize, source: PatchSource,
                           instr: Instrument, note: u8, key: u8, volume: u8) {
        trace!("note on ch={} note={} key={} vol={}", ch, note, key, volume);

        let mut double_voice = instr.flags & FLAG_DOUBLE_VOICE != 0;

        let voice = match self.allocate_voice() {
            Some(v) => Some(v),
            None    => {
                self.replace_voice(chip, None);
                self.allocate_voice()
            },
        };
        let voice = try_option!(voice);

        // second voice of a double-voice instrument; a single steal
        // attempt, then fall back to single-voice playback
        let voice2 = if double_voice {
            match self.allocate_voice() {
                Some(v) => Some(v),
                None    => {
                    self.replace_voice(chip, Some(voice));
                    self.allocate_voice()
                },
            }
        } else {
            None
        };
        if double_voice && voice2.is_none() {
            double_voice = false;
        }

        self.start_voice(chip, voice, ch, source, instr, 0, note, key, volume);

        if double_voice {
            if let Some(voice2) = voice2 {
                self.start_voice(chip, voice2, ch, source, instr, 1, note, key, volume);
            }
        }
    }

    fn start_voice<C: OplChip>(&mut self, chip: &mut C, v: usize, ch: usize,
                               source: PatchSource, instr: Instrument, instr_voice: usize,
                               note: u8, key: u8, volume: u8) {
        self.voices[v].channel = Some(ch);
        self.voices[v].key = key;
        self.voices[v].note = if instr.flags & FLAG_FIXED != 0 {
            instr.fixed_note
        } else {
            note
        };
        self.voices[v].reg_pan = self.channels[ch].pan_reg;

        self.set_voice_instrument(chip, v, source, instr, instr_voice);
        self.set_voice_volume(chip, v, volume);

        // writing the frequency issues the key-on bit; force the shadow
        // stale first so the write always happens
        self.voices[v].freq = 0;
        self.update_voice_frequency(chip, v);
    }

    /// Release every voice sounding `key` on `ch`. Both voices of a
    /// double-voice note match, so the scan never stops early.
    fn note_off<C: OplChip>(&mut self, chip: &mut C, ch: usize, key: u8) {
        for v in 0..self.num_voices {
            if self.voices[v].in_use && self.voices[v].channel == Some(ch)
                                     && self.voices[v].key == key {
                self.release_voice(chip, v);
            }
        }
    }

    fn release_all_for<C: OplChip>(&mut self, chip: &mut C, ch: usize) {
        for v in 0..self.num_voices {
            if self.voices[v].in_use && self.voices[v].channel == Some(ch) {
                self.release_voice(chip, v);
            }
        }
    }

    fn reset_controllers<C: OplChip>(&mut self, chip: &mut C, ch: usize) {
        self.set_channel_volume(chip, ch, 100);
        self.set_channel_pan(chip, ch, 64);
        self.channels[ch].bend = 0;
    }

    /// First-free allocation, in voice index order.
    fn allocate_voice(&mut self) -> Option<usize> {
        for v in 0..self.num_voices {
            if !self.voices[v].in_use {
                self.voices[v].in_use = true;
                return Some(v);
            }
        }
        None
    }

    /// Steal a voice: the first secondary voice of a double-voice pair
    /// wins outright; otherwise prefer the voice owned by the highest
    /// channel (lowest priority in DMX), later voices winning ties.
    /// `exclude` protects a voice allocated moments ago.
    fn replace_voice<C: OplChip>(&mut self, chip: &mut C, exclude: Option<usize>) {
        let mut result = 0;

        for v in 0..self.num_voices {
            if Some(v) == exclude || !self.voices[v].in_use {
                continue;
            }
            if self.voices[v].instr_voice != 0 {
                result = v;
                break;
            }

            let voice_channel = self.voices[v].channel.unwrap_or(0);
            let result_channel = self.voices[result].channel.unwrap_or(0);
            if voice_channel >= result_channel {
                result = v;
            }
        }

        if Some(result) != exclude && self.voices[result].in_use {
            debug!("stealing voice {} from channel {:?}", result, self.voices[result].channel);
            self.release_voice(chip, result);
        }
    }

    /// Key the voice off and return it to the pool. Register shadows are
    /// kept so a reuse can skip redundant writes; only the loaded-patch
    /// identity is cleared, forcing the next use to reprogram operators.
    fn release_voice<C: OplChip>(&mut self, chip: &mut C, v: usize) {
        if !self.voices[v].in_use {
            return;
        }

        self.key_off(chip, v);
        self.voices[v].in_use = false;
        self.voices[v].channel = None;
        self.voices[v].loaded = None;
    }

    // Clear the key-on bit, keeping the frequency bits intact.
    fn key_off<C: OplChip>(&mut self, chip: &mut C, v: usize) {
        let voice = self.voices[v];
        self.regs.write(chip, (REG_FREQ_HI + voice.index as u16) | voice.array,
                        (voice.freq >> 8) as u8);
    }

    fn set_voice_instrument<C: OplChip>(&mut self, chip: &mut C, v: usize,
                                        source: PatchSource, instr: Instrument,
                                        instr_voice: usize) {
        if self.voices[v].loaded == Some((source, instr_voice)) {
            return;
        }

        self.voices[v].instr = instr;
        self.voices[v].instr_voice = instr_voice;
        self.voices[v].loaded = Some((source, instr_voice));

        let voice = self.voices[v];
        let data = instr.voices[instr_voice];

        // feedback bit 0 clear means the modulator feeds the carrier;
        // set means both operators sound (additive mode)
        let modulating = data.feedback & 0x01 == 0;

        // DMX loads the carrier first, muted until the voice volume is set
        let car_level = self.load_operator(chip, voice.op2 | voice.array, &data.carrier, true);
        let mod_level = self.load_operator(chip, voice.op1 | voice.array, &data.modulator,
                                           !modulating);
        self.voices[v].car_level = car_level;
        self.voices[v].mod_level = mod_level;

        self.regs.write(chip, (REG_FEEDBACK + voice.index as u16) | voice.array,
                        data.feedback | voice.reg_pan);
    }

    // Program one operator; returns the level register value for the shadow.
    fn load_operator<C: OplChip>(&mut self, chip: &mut C, op: u16, data: &OpData,
                                 silent: bool) -> u8 {
        let level = data.scale | if silent { 0x3f } else { data.level };

        self.regs.write(chip, REG_LEVEL + op, level);
        self.regs.write(chip, REG_TREMOLO + op, data.tremolo);
        self.regs.write(chip, REG_ATTACK + op, data.attack);
        self.regs.write(chip, REG_SUSTAIN + op, data.sustain);
        self.regs.write(chip, REG_WAVEFORM + op, data.waveform);

        level
    }

    /// Combine note velocity and channel volume into the carrier level.
    /// In additive mode the modulator level scales along with it.
    fn set_voice_volume<C: OplChip>(&mut self, chip: &mut C, v: usize, volume: u8) {
        self.voices[v].note_volume = volume;

        let voice = self.voices[v];
        let chan = match voice.channel {
            Some(c) => self.channels[c],
            None    => return,
        };
        let data = voice.instr.voices[voice.instr_voice];

        let midi_volume = 2 * (VOLUME_MAPPING[chan.volume as usize] as u32 + 1);
        let mut full_volume = (VOLUME_MAPPING[volume as usize] as u32 * midi_volume) >> 9;
        if full_volume > 0x3f {
            full_volume = 0x3f;
        }

        let car_volume = 0x3f - full_volume as u8;

        if car_volume != voice.car_level & 0x3f {
            let car_level = car_volume | (voice.car_level & 0xc0);
            self.voices[v].car_level = car_level;
            self.regs.write(chip, (REG_LEVEL + voice.op2) | voice.array, car_level);

            if data.feedback & 0x01 != 0 && data.modulator.level != 0x3f {
                let mut mod_volume = data.modulator.level;
                if mod_volume < car_volume {
                    mod_volume = car_volume;
                }
                mod_volume |= voice.mod_level & 0xc0;

                if mod_volume != voice.mod_level {
                    self.voices[v].mod_level = mod_volume;
                    self.regs.write(chip, (REG_LEVEL + voice.op1) | voice.array,
                                    mod_volume | (data.modulator.scale & 0xc0));
                }
            }
        }
    }

    fn set_voice_pan<C: OplChip>(&mut self, chip: &mut C, v: usize, reg_pan: u8) {
        if self.voices[v].reg_pan == reg_pan || self.voices[v].loaded.is_none() {
            return;
        }

        self.voices[v].reg_pan = reg_pan;
        let voice = self.voices[v];
        let data = voice.instr.voices[voice.instr_voice];
        self.regs.write(chip, (REG_FEEDBACK + voice.index as u16) | voice.array,
                        data.feedback | reg_pan);
    }

    fn update_voice_frequency<C: OplChip>(&mut self, chip: &mut C, v: usize) {
        let freq = self.frequency_for_voice(v);
        if self.voices[v].freq == freq {
            return;
        }

        let voice = self.voices[v];
        self.regs.write(chip, (REG_FREQ_LO + voice.index as u16) | voice.array,
                        (freq & 0xff) as u8);
        self.regs.write(chip, (REG_FREQ_HI + voice.index as u16) | voice.array,
                        ((freq >> 8) | 0x20) as u8);
        self.voices[v].freq = freq;
    }

    /// Frequency register value for the voice's note, bend and tuning.
    fn frequency_for_voice(&self, v: usize) -> u16 {
        let voice = &self.voices[v];
        let data = &voice.instr.voices[voice.instr_voice];

        let mut note = voice.note as i32;
        if voice.instr.flags & FLAG_FIXED == 0 {
            note += data.base_note_offset as i32;
        }

        // transpose into the covered octaves
        while note < 0 {
            note += 12;
        }
        while note > 95 {
            note -= 12;
        }

        let bend = match voice.channel {
            Some(c) => self.channels[c].bend as i32,
            None    => 0,
        };

        let mut freq_index = 64 + 32 * note + bend;

        // the second voice of a double-voice instrument is detuned
        if voice.instr_voice != 0 {
            freq_index += (voice.instr.fine_tuning as i32 / 2) - 64;
        }

        if freq_index < 0 {
            freq_index = 0;
        }

        // the start of the table covers the first seven MIDI notes
        if (freq_index as usize) < 284 {
            return FREQUENCY_CURVE[freq_index as usize];
        }

        let sub = (freq_index as usize - 284) % 384;
        let mut octave = (freq_index as usize - 284) / 384;
        if octave > 7 {
            octave = 7;
        }

        FREQUENCY_CURVE[sub + 284] | ((octave as u16) << 10)
    }

    /// Channel volume controller; clamps to 127, caps at the master
    /// volume, and refreshes every sounding voice of the channel.
    fn set_channel_volume<C: OplChip>(&mut self, chip: &mut C, ch: usize, volume: u8) {
        let base = if volume > 127 { 127 } else { volume };
        self.channels[ch].volume_base = base;
        self.channels[ch].volume = if base > self.music_volume {
            self.music_volume
        } else {
            base
        };

        for v in 0..self.num_voices {
            if self.voices[v].in_use && self.voices[v].channel == Some(ch) {
                let note_volume = self.voices[v].note_volume;
                self.set_voice_volume(chip, v, note_volume);
            }
        }
    }

    /// Pan controller: MIDI 0-127 to the OPL3 output-enable bits. Ignored
    /// on OPL2, which has a single output.
    fn set_channel_pan<C: OplChip>(&mut self, chip: &mut C, ch: usize, pan: u8) {
        if !self.opl3 {
            return;
        }

        let reg_pan = if pan >= 96 {
            0x10
        } else if pan <= 48 {
            0x20
        } else {
            0x30
        };

        if self.channels[ch].pan_reg == reg_pan {
            return;
        }
        self.channels[ch].pan_reg = reg_pan;

        for v in 0..self.num_voices {
            if self.voices[v].in_use && self.voices[v].channel == Some(ch) {
                self.set_voice_pan(chip, v, reg_pan);
            }
        }
    }

    /// Master volume: re-derives every channel's effective volume.
    pub fn set_master_volume<C: OplChip>(&mut self, chip: &mut C, volume: u8) {
        self.music_volume = if volume > 127 { 127 } else { volume };

        for ch in 0..MIDI_CHANNELS {
            let base = self.channels[ch].volume_base;
            self.set_channel_volume(chip, ch, base);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use format::genmidi::{OpData, PatchVoice};
    use opl::CaptureChip;

    fn patch_voice(level: u8, feedback: u8, waveform: u8) -> PatchVoice {
        PatchVoice {
            modulator: OpData {
                tremolo: 0x21, attack: 0xf4, sustain: 0x77,
                waveform, scale: 0x40, level,
            },
            feedback,
            carrier: OpData {
                tremolo: 0x31, attack: 0xf2, sustain: 0x74,
                waveform, scale: 0x00, level: 0x00,
            },
            base_note_offset: 0,
        }
    }

    fn instrument(flags: u16) -> Instrument {
        Instrument {
            flags,
            fine_tuning: 128,
            fixed_note : 60,
            voices     : [patch_voice(0x18, 0x0a, 0x01), patch_voice(0x10, 0x0a, 0x02)],
        }
    }

    fn bank() -> InstrumentBank {
        let mut melodic = vec![instrument(0); 128];
        melodic[1] = instrument(FLAG_DOUBLE_VOICE);
        let mut percussion = vec![instrument(FLAG_FIXED); 47];
        percussion[0].fixed_note = 36;
        InstrumentBank { melodic, percussion }
    }

    fn player() -> (DmxPlayer, CaptureChip, InstrumentBank) {
        let mut chip = CaptureChip::new();
        let mut dmx = DmxPlayer::new(true, 127);
        dmx.init_registers(&mut chip);
        chip.writes.clear();
        (dmx, chip, bank())
    }

    fn play(dmx: &mut DmxPlayer, chip: &mut CaptureChip, bank: &InstrumentBank,
            ch: u8, note: u8, vel: u8) {
        let event = Event::PlayNote { channel: ch, note, velocity: Some(vel) };
        dmx.handle_event(chip, Some(bank), &event);
    }

    fn release(dmx: &mut DmxPlayer, chip: &mut CaptureChip, bank: &InstrumentBank,
               ch: u8, note: u8) {
        let event = Event::ReleaseNote { channel: ch, note };
        dmx.handle_event(chip, Some(bank), &event);
    }

    fn in_use(dmx: &DmxPlayer) -> usize {
        dmx.voices.iter().filter(|v| v.in_use).count()
    }

    #[test]
    fn test_init_registers() {
        let mut chip = CaptureChip::new();
        let mut dmx = DmxPlayer::new(true, 100);
        dmx.init_registers(&mut chip);

        // level registers on both arrays are muted
        assert!(chip.writes.contains(&(REG_LEVEL, 0x3f)));
        assert!(chip.writes.contains(&(REG_LEVEL | 0x100, 0x3f)));
        // timers reset, waveform select on, OPL3 enabled
        assert!(chip.writes.contains(&(REG_TIMER_CTRL, 0x60)));
        assert!(chip.writes.contains(&(REG_TIMER_CTRL, 0x80)));
        assert!(chip.writes.contains(&(REG_TEST, 0x20)));
        assert!(chip.writes.contains(&(REG_OPL3_ENABLE, 0x01)));
    }

    #[test]
    fn test_init_registers_opl2() {
        let mut chip = CaptureChip::new();
        let mut dmx = DmxPlayer::new(false, 100);
        dmx.init_registers(&mut chip);

        assert!(!chip.writes.contains(&(REG_OPL3_ENABLE, 0x01)));
        assert!(!chip.writes.iter().any(|&(r, _)| r >= 0x100));
    }

    #[test]
    fn test_note_on_register_sequence() {
        let (mut dmx, mut chip, bank) = player();
        play(&mut dmx, &mut chip, &bank, 0, 60, 100);

        // the muted-carrier load repeats the 0x3f the init sweep left in
        // the level register, so the shadow file swallows it
        assert!(!chip.writes.contains(&(REG_LEVEL + dmx.voices[0].op2, 0x3f)));
        assert!(chip.writes.contains(&(REG_TREMOLO + dmx.voices[0].op2, 0x31)));
        assert!(chip.writes.contains(&(REG_WAVEFORM + dmx.voices[0].op1, 0x01)));
        // the modulator sounds in FM mode, so it loads at its patch level
        assert!(chip.writes.contains(&(REG_LEVEL + dmx.voices[0].op1, 0x40 | 0x18)));
        // feedback carries the center pan bits
        assert!(chip.writes.contains(&(REG_FEEDBACK, 0x0a | 0x30)));

        // velocity 100 at channel volume 100: map[100] = 114, so the
        // attenuation is 0x3f - ((114 * 2 * (114 + 1)) >> 9) = 0x3f - 51
        assert!(chip.writes.contains(&(REG_LEVEL + dmx.voices[0].op2, 0x3f - 51)));

        // the last write keys the note on
        let (reg, value) = *chip.writes.last().unwrap();
        assert_eq!(reg, REG_FREQ_HI);
        assert_ne!(value & 0x20, 0);
        assert_eq!(dmx.voices[0].freq, FREQUENCY_CURVE[(1984 - 284) % 384 + 284] | (4 << 10));
    }

    #[test]
    fn test_note_off_clears_key_bit() {
        let (mut dmx, mut chip, bank) = player();
        play(&mut dmx, &mut chip, &bank, 0, 60, 100);
        let freq = dmx.voices[0].freq;

        chip.writes.clear();
        release(&mut dmx, &mut chip, &bank, 0, 60);

        assert_eq!(chip.writes, vec![(REG_FREQ_HI, (freq >> 8) as u8)]);
        assert_eq!(in_use(&dmx), 0);
        assert!(dmx.voices[0].channel.is_none());
        // shadows survive the release
        assert_eq!(dmx.voices[0].freq, freq);
    }

    #[test]
    fn test_note_off_only_matches_key_and_channel() {
        let (mut dmx, mut chip, bank) = player();
        play(&mut dmx, &mut chip, &bank, 0, 60, 100);
        play(&mut dmx, &mut chip, &bank, 0, 64, 100);
        play(&mut dmx, &mut chip, &bank, 1, 60, 100);

        release(&mut dmx, &mut chip, &bank, 0, 60);

        assert_eq!(in_use(&dmx), 2);
        assert!(!dmx.voices.iter().any(|v| v.in_use && v.channel == Some(0) && v.key == 60));
        assert!(dmx.voices.iter().any(|v| v.in_use && v.channel == Some(1) && v.key == 60));
    }

    #[test]
    fn test_zero_velocity_is_release() {
        let (mut dmx, mut chip, bank) = player();
        play(&mut dmx, &mut chip, &bank, 0, 60, 100);
        play(&mut dmx, &mut chip, &bank, 0, 60, 0);
        assert_eq!(in_use(&dmx), 0);
    }

    #[test]
    fn test_velocity_memory() {
        let (mut dmx, mut chip, bank) = player();
        play(&mut dmx, &mut chip, &bank, 0, 60, 90);
        let event = Event::PlayNote { channel: 0, note: 62, velocity: None };
        dmx.handle_event(&mut chip, Some(&bank), &event);

        assert_eq!(dmx.voices[1].note_volume, 90);
    }

    #[test]
    fn test_percussion_channel() {
        let (mut dmx, mut chip, bank) = player();
        play(&mut dmx, &mut chip, &bank, 9, 35, 100);

        // fixed-pitch kick drum: frequency note from the patch, key as received
        assert!(dmx.voices[0].in_use);
        assert_eq!(dmx.voices[0].key, 35);
        assert_eq!(dmx.voices[0].note, 36);
        assert_eq!(dmx.voices[0].loaded, Some((PatchSource::Percussion(0), 0)));

        release(&mut dmx, &mut chip, &bank, 9, 35);
        assert_eq!(in_use(&dmx), 0);

        // a patch fixed at the percussion base note keeps note 60
        play(&mut dmx, &mut chip, &bank, 9, 36, 100);
        assert_eq!(dmx.voices[0].key, 36);
        assert_eq!(dmx.voices[0].note, 60);
    }

    #[test]
    fn test_percussion_out_of_range_falls_back() {
        let (mut dmx, mut chip, bank) = player();
        play(&mut dmx, &mut chip, &bank, 9, 20, 100);
        assert_eq!(dmx.voices[0].loaded, Some((PatchSource::Melodic(0), 0)));
    }

    #[test]
    fn test_voice_steal() {
        let (mut dmx, mut chip, bank) = player();
        for n in 0..19 {
            play(&mut dmx, &mut chip, &bank, 0, 40 + n, 100);
        }

        // all voices on one channel: the scan prefers the last voice, so
        // the 18th note's voice was stolen for the 19th
        assert_eq!(in_use(&dmx), 18);
        assert!(!dmx.voices.iter().any(|v| v.in_use && v.key == 40 + 17));
        assert_eq!(dmx.voices[17].key, 40 + 18);
    }

    #[test]
    fn test_voice_steal_prefers_high_channels() {
        let (mut dmx, mut chip, bank) = player();
        for n in 0..17 {
            play(&mut dmx, &mut chip, &bank, 3, 40 + n, 100);
        }
        play(&mut dmx, &mut chip, &bank, 1, 90, 100);
        play(&mut dmx, &mut chip, &bank, 2, 91, 100);

        // the victim comes from channel 3, not the lower-priority channels
        assert!(dmx.voices.iter().any(|v| v.in_use && v.channel == Some(1)));
        assert!(dmx.voices.iter().any(|v| v.in_use && v.channel == Some(2)));
        assert_eq!(in_use(&dmx), 18);
    }

    #[test]
    fn test_double_voice() {
        let (mut dmx, mut chip, bank) = player();
        let event = Event::Controller { channel: 0, ctrl: 0, value: 1 };
        dmx.handle_event(&mut chip, Some(&bank), &event);

        play(&mut dmx, &mut chip, &bank, 0, 60, 100);
        assert_eq!(in_use(&dmx), 2);
        assert_eq!(dmx.voices[0].instr_voice, 0);
        assert_eq!(dmx.voices[1].instr_voice, 1);
        assert_eq!(dmx.voices[1].key, 60);

        // one release drops both voices
        release(&mut dmx, &mut chip, &bank, 0, 60);
        assert_eq!(in_use(&dmx), 0);
    }

    #[test]
    fn test_double_voice_steals_for_second_voice() {
        let (mut dmx, mut chip, bank) = player();
        for n in 0..17 {
            play(&mut dmx, &mut chip, &bank, 2, 40 + n, 100);
        }

        let event = Event::Controller { channel: 0, ctrl: 0, value: 1 };
        dmx.handle_event(&mut chip, Some(&bank), &event);
        play(&mut dmx, &mut chip, &bank, 0, 60, 100);

        // first voice took the free slot; the steal freed one more for
        // the second, keeping the pool full
        assert_eq!(in_use(&dmx), 18);
        assert_eq!(dmx.voices.iter().filter(|v| v.in_use && v.channel == Some(0)).count(), 2);
    }

    #[test]
    fn test_steal_prefers_secondary_voice() {
        let (mut dmx, mut chip, bank) = player();
        let event = Event::Controller { channel: 0, ctrl: 0, value: 1 };
        dmx.handle_event(&mut chip, Some(&bank), &event);
        play(&mut dmx, &mut chip, &bank, 0, 60, 100);   // voices 0 and 1

        for n in 0..16 {
            play(&mut dmx, &mut chip, &bank, 5, 70 + n, 100);
        }
        assert_eq!(in_use(&dmx), 18);

        play(&mut dmx, &mut chip, &bank, 5, 99, 100);

        // the stolen voice was the double-voice secondary on voice 1
        assert_eq!(dmx.voices[1].key, 99);
        assert_eq!(dmx.voices[1].channel, Some(5));
        assert_eq!(dmx.voices[0].key, 60);
    }

    #[test]
    fn test_pitch_bend_rewrites_frequency() {
        let (mut dmx, mut chip, bank) = player();
        play(&mut dmx, &mut chip, &bank, 0, 60, 100);
        let freq_before = dmx.voices[0].freq;

        chip.writes.clear();
        let event = Event::PitchBend { channel: 0, value: 0 };
        dmx.handle_event(&mut chip, Some(&bank), &event);

        assert_eq!(dmx.channels[0].bend, -64);
        assert_ne!(dmx.voices[0].freq, freq_before);
        assert!(chip.writes.iter().any(|&(r, _)| r == REG_FREQ_LO));
        let hi: Vec<u8> = chip.writes_to(REG_FREQ_HI);
        assert_eq!(hi.len(), 1);
        assert_ne!(hi[0] & 0x20, 0);   // still keyed on
    }

    #[test]
    fn test_all_notes_off() {
        let (mut dmx, mut chip, bank) = player();
        play(&mut dmx, &mut chip, &bank, 2, 60, 100);
        play(&mut dmx, &mut chip, &bank, 2, 64, 100);
        play(&mut dmx, &mut chip, &bank, 2, 67, 100);
        play(&mut dmx, &mut chip, &bank, 3, 50, 100);

        let event = Event::System { channel: 2, code: 11 };
        dmx.handle_event(&mut chip, Some(&bank), &event);
        assert_eq!(in_use(&dmx), 1);

        // the freed slots are reused from the bottom
        play(&mut dmx, &mut chip, &bank, 2, 72, 100);
        assert!(dmx.voices[0].in_use);
        assert_eq!(dmx.voices[0].key, 72);
    }

    #[test]
    fn test_channel_volume_refreshes_voices() {
        let (mut dmx, mut chip, bank) = player();
        play(&mut dmx, &mut chip, &bank, 0, 60, 100);

        chip.writes.clear();
        let event = Event::Controller { channel: 0, ctrl: 3, value: 40 };
        dmx.handle_event(&mut chip, Some(&bank), &event);

        assert_eq!(dmx.channels[0].volume, 40);
        let levels = chip.writes_to(REG_LEVEL + dmx.voices[0].op2);
        assert_eq!(levels.len(), 1);

        // same value again produces no further writes
        chip.writes.clear();
        dmx.handle_event(&mut chip, Some(&bank), &event);
        assert!(chip.writes.is_empty());
    }

    #[test]
    fn test_master_volume_caps_channels() {
        let (mut dmx, mut chip, bank) = player();
        dmx.set_master_volume(&mut chip, 50);

        assert_eq!(dmx.channels[0].volume, 50);
        assert_eq!(dmx.channels[0].volume_base, 100);

        dmx.set_master_volume(&mut chip, 127);
        assert_eq!(dmx.channels[0].volume, 100);
    }

    #[test]
    fn test_pan_mapping() {
        let (mut dmx, mut chip, bank) = player();
        play(&mut dmx, &mut chip, &bank, 0, 60, 100);

        chip.writes.clear();
        let event = Event::Controller { channel: 0, ctrl: 4, value: 10 };
        dmx.handle_event(&mut chip, Some(&bank), &event);
        assert_eq!(dmx.channels[0].pan_reg, 0x20);
        assert_eq!(chip.writes, vec![(REG_FEEDBACK, 0x0a | 0x20)]);

        let event = Event::Controller { channel: 0, ctrl: 4, value: 110 };
        dmx.handle_event(&mut chip, Some(&bank), &event);
        assert_eq!(dmx.channels[0].pan_reg, 0x10);

        let event = Event::Controller { channel: 0, ctrl: 4, value: 64 };
        dmx.handle_event(&mut chip, Some(&bank), &event);
        assert_eq!(dmx.channels[0].pan_reg, 0x30);

        // repeating the center position is a no-op
        chip.writes.clear();
        dmx.handle_event(&mut chip, Some(&bank), &event);
        assert!(chip.writes.is_empty());
    }

    #[test]
    fn test_pan_ignored_on_opl2() {
        let mut chip = CaptureChip::new();
        let mut dmx = DmxPlayer::new(false, 127);
        dmx.init_registers(&mut chip);
        let bank = bank();

        play(&mut dmx, &mut chip, &bank, 0, 60, 100);
        chip.writes.clear();
        let event = Event::Controller { channel: 0, ctrl: 4, value: 10 };
        dmx.handle_event(&mut chip, Some(&bank), &event);

        assert_eq!(dmx.channels[0].pan_reg, 0x30);
        assert!(chip.writes.is_empty());
    }

    #[test]
    fn test_opl2_limits_pool_to_nine() {
        let mut chip = CaptureChip::new();
        let mut dmx = DmxPlayer::new(false, 127);
        dmx.init_registers(&mut chip);
        let bank = bank();

        for n in 0..12 {
            play(&mut dmx, &mut chip, &bank, 0, 40 + n, 100);
        }
        assert_eq!(in_use(&dmx), 9);
        assert!(!dmx.voices[9..].iter().any(|v| v.in_use));
    }

    #[test]
    fn test_reset_controllers() {
        let (mut dmx, mut chip, bank) = player();
        let events = [
            Event::Controller { channel: 0, ctrl: 3, value: 20 },
            Event::Controller { channel: 0, ctrl: 4, value: 0 },
            Event::PitchBend { channel: 0, value: 200 },
            Event::System { channel: 0, code: 14 },
        ];
        for event in events.iter() {
            dmx.handle_event(&mut chip, Some(&bank), event);
        }

        assert_eq!(dmx.channels[0].volume, 100);
        assert_eq!(dmx.channels[0].pan_reg, 0x30);
        assert_eq!(dmx.channels[0].bend, 0);
    }

    #[test]
    fn test_program_change() {
        let (mut dmx, mut chip, bank) = player();
        let event = Event::Controller { channel: 0, ctrl: 0, value: 0x85 };
        dmx.handle_event(&mut chip, Some(&bank), &event);

        // out-of-range programs are masked into the bank
        assert_eq!(dmx.channels[0].program, 5);
        play(&mut dmx, &mut chip, &bank, 0, 60, 100);
        assert_eq!(dmx.voices[0].loaded, Some((PatchSource::Melodic(5), 0)));
    }

    #[test]
    fn test_notes_ignored_without_bank() {
        let mut chip = CaptureChip::new();
        let mut dmx = DmxPlayer::new(true, 127);
        dmx.init_registers(&mut chip);
        chip.writes.clear();

        let event = Event::PlayNote { channel: 0, note: 60, velocity: Some(100) };
        dmx.handle_event(&mut chip, None, &event);
        assert_eq!(in_use(&dmx), 0);
        assert!(chip.writes.is_empty());
    }

    #[test]
    fn test_frequency_bend_range() {
        let (mut dmx, mut chip, bank) = player();
        play(&mut dmx, &mut chip, &bank, 0, 0, 100);

        // lowest note with an extreme down-bend clamps at the table start
        let event = Event::PitchBend { channel: 0, value: 0 };
        dmx.handle_event(&mut chip, Some(&bank), &event);
        assert_eq!(dmx.voices[0].freq, FREQUENCY_CURVE[0]);
    }
}
