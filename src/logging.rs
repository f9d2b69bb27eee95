/// Logger setup: `<prog>: <LEVEL>: <message>` lines on stderr
use env_logger::{Builder, Env, Target};
use log::LevelFilter;
use std::io::{self, Write};

/// Translates `\n` into `\r\n` so lines stay aligned while the caller's
/// terminal is in raw mode
pub struct CrlfWriter<W> {
    inner: W,
}

impl<W: Write> CrlfWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for CrlfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = Vec::with_capacity(buf.len() + 8);
        let mut previous = 0u8;
        for &byte in buf {
            if byte == b'\n' && previous != b'\r' {
                out.push(b'\r');
            }
            out.push(byte);
            previous = byte;
        }
        self.inner.write_all(&out)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Initialize the logger. `-v` forces debug; otherwise `RUST_LOG` applies,
/// defaulting to warnings only.
pub fn init(prog: &'static str, verbose: bool) {
    let env = Env::default().filter_or("RUST_LOG", "warn");
    let mut builder = Builder::from_env(env);
    if verbose {
        builder.filter_level(LevelFilter::Debug);
    }

    let result = builder
        .format(move |buf, record| writeln!(buf, "{}: {}: {}", prog, record.level(), record.args()))
        .target(Target::Pipe(Box::new(CrlfWriter::new(io::stderr()))))
        .try_init();

    // A second init (tests) keeps the first logger
    if let Err(e) = result {
        log::debug!("logger already initialized: {}", e);
    }
}
