//! Minimal command-line BGZF compressor: reads stdin, writes BGZF-compressed data to stdout.
use std::io::{self, Read, Write};
use std::process::ExitCode;

use bgzf::{CompressionLevel, Writer, BGZF_BLOCK_SIZE};

const USAGE: &str = "bgzip: produce BGZF-compressed data from standard input\n\nUsage: bgzip < input > output.bgz\n\nTakes no arguments; reads all of standard input and writes BGZF-compressed\noutput to standard output.";

fn main() -> ExitCode {
    env_logger::init();

    if std::env::args().count() > 1 {
        println!("{USAGE}");
        return ExitCode::SUCCESS;
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("bgzip failed: {e}");
            eprintln!("bgzip: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> bgzf::BgzfResult<()> {
    eprintln!("Producing BGZF output from stdin...");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut writer = Writer::new(stdout.lock(), CompressionLevel::default_level());

    let mut reader = stdin.lock();
    let mut chunk = vec![0u8; BGZF_BLOCK_SIZE];
    loop {
        let n = reader.read(&mut chunk).map_err(bgzf::BgzfError::Io)?;
        if n == 0 {
            break;
        }
        writer.write_all(&chunk[..n]).map_err(bgzf::BgzfError::Io)?;
        log::debug!("wrote {n} bytes from stdin");
    }
    writer.finish()?;

    eprintln!("BGZF data produced");
    Ok(())
}
