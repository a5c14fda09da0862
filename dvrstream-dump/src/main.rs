// DvrStream
// Copyright (c) 2025 The DvrStream Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs::File;
use std::io::{self, SeekFrom, Write};
use std::process;

use clap::{App, Arg, ArgMatches};
use log::{error, info};

use dvrstream::stream::{DvrStream, DvrStreamOptions};

fn main() {
    pretty_env_logger::init();

    let matches = App::new("DvrStream Dump")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Dump a DVR HTTP stream to a file")
        .arg(
            Arg::new("seek")
                .long("seek")
                .short('s')
                .value_name("OFFSET")
                .help("Seek to the given byte offset before dumping")
                .takes_value(true),
        )
        .arg(
            Arg::new("bytes")
                .long("bytes")
                .short('n')
                .value_name("COUNT")
                .help("Stop after dumping COUNT bytes")
                .takes_value(true),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .short('o')
                .value_name("FILE")
                .help("Write to FILE instead of stdout")
                .takes_value(true),
        )
        .arg(
            Arg::new("buffer")
                .long("buffer")
                .value_name("BYTES")
                .help("Ring buffer capacity in bytes")
                .takes_value(true),
        )
        .arg(
            Arg::new("user-agent")
                .long("user-agent")
                .value_name("AGENT")
                .help("User-Agent header to send")
                .takes_value(true),
        )
        .arg(Arg::new("URL").help("URL of the stream").required(true).index(1))
        .get_matches();

    if let Err(err) = run(&matches) {
        error!("{}", err);
        process::exit(1);
    }
}

fn run(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let url = matches.value_of("URL").unwrap();

    let mut options = DvrStreamOptions::default();

    if let Some(len) = matches.value_of("buffer") {
        options.buffer_len = len.parse()?;
    }
    options.user_agent = matches.value_of("user-agent").map(str::to_string);

    let mut stream = DvrStream::open_with_options(url, options)?;

    info!(
        "stream opened: length={} seekable={} real-time={}",
        stream.length().map_or_else(|| "unknown".to_string(), |len| len.to_string()),
        stream.can_seek(),
        stream.real_time(),
    );

    if let Some(offset) = matches.value_of("seek") {
        let pos = stream.seek(SeekFrom::Start(offset.parse()?))?;
        info!("seeked to byte {}", pos);
    }

    let limit = match matches.value_of("bytes") {
        Some(count) => Some(count.parse::<u64>()?),
        None => None,
    };

    let mut output: Box<dyn Write> = match matches.value_of("output") {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout()),
    };

    // A single read may not request as much as the whole buffer holds.
    let mut buf = vec![0u8; (stream.capacity() / 2).min(64 * 1024)];
    let mut total: u64 = 0;
    let mut last_report: u64 = 0;

    loop {
        let want = match limit {
            Some(limit) if total >= limit => break,
            Some(limit) => buf.len().min((limit - total) as usize),
            None => buf.len(),
        };

        let count = stream.read(&mut buf[..want])?;
        if count == 0 {
            break;
        }

        output.write_all(&buf[..count])?;
        total += count as u64;

        // Report progress every 4 MiB, with the stream clock when the
        // transport packets carry usable references.
        if total - last_report >= 4 * 1024 * 1024 {
            last_report = total;

            let clock = stream.current_time().and_then(|time| {
                time.duration_since(stream.start_time()?).ok()
            });

            match clock {
                Some(elapsed) => {
                    info!("dumped {} bytes ({} s of stream clock)", total, elapsed.as_secs())
                }
                None => info!("dumped {} bytes", total),
            }
        }
    }

    output.flush()?;
    info!("done: {} bytes written", total);

    Ok(())
}
