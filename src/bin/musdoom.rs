extern crate getopts;
extern crate memmap;
extern crate musdoom;

use std::env;
use std::error::Error;
use std::fs::File;
use getopts::Options;
use memmap::Mmap;
use musdoom::format::{InstrumentBank, MusScore};
use musdoom::format::mus::Event;

fn main() {
    let args: Vec<String> = env::args().collect();
    let mut opts = Options::new();

    opts.optflag("h", "help", "display usage information and exit");
    opts.optflag("e", "events", "dump the decoded event stream");
    opts.optopt("g", "genmidi", "load a GENMIDI instrument bank", "FILE");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(e) => {
            println!("{}", e);
            return;
        }
    };

    if matches.opt_present("h") || matches.free.len() < 1 {
        let brief = format!("Usage: {} [options] filename.mus", args[0]);
        print!("{}", opts.usage(&brief));
        return;
    }

    match run(&matches.free[0], matches.opt_str("g"), matches.opt_present("e")) {
        Ok(_)  => {},
        Err(e) => eprintln!("error: {}", e),
    }
}

fn run(name: &str, genmidi: Option<String>, dump_events: bool) -> Result<(), Box<Error>> {
    let file = File::open(name)?;
    let mmap = unsafe { Mmap::map(&file).expect("failed to map the file") };

    let score = MusScore::load(&mmap[..])?;

    println!("Score bytes    : {}", score.score_len());
    println!("Channels       : {} + {} secondary", score.channels, score.sec_channels);
    println!("Instruments    : {}", score.instr_count);

    let ms = score.duration_ms();
    println!("Duration       : {}:{:02}.{:03}", ms / 60000, ms / 1000 % 60, ms % 1000);

    if let Some(name) = genmidi {
        let file = File::open(&name)?;
        let mmap = unsafe { Mmap::map(&file).expect("failed to map the file") };
        let bank = InstrumentBank::load(&mmap[..])?;
        println!("GENMIDI bank   : {} melodic, {} percussion instruments",
                 bank.melodic.len(), bank.percussion.len());
    }

    if dump_events {
        println!();
        let mut reader = score.reader();
        let mut ticks: u64 = 0;
        loop {
            let (event, delay) = reader.next_event()?;
            println!("{:8} {}", ticks, event);
            if event == Event::EndOfScore {
                break;
            }
            ticks += delay as u64;
        }
    }

    Ok(())
}
