//! Transparent gzip/bgzip decoding.
//!
//! Input is sniffed for the gzip magic bytes rather than trusted by file
//! extension. Compressed input goes through a [`DecompressBackend`]; the
//! backend in use is chosen at build time with cargo features and the rest of
//! the pipeline only ever sees the trait.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::bufread::MultiGzDecoder;

use crate::error::{CountError, DecompressKind};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Read-side buffer for the raw file, independent of the chunk window.
pub const FILE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// A gzip decoding capability.
pub trait DecompressBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Wraps a stream positioned at the first gzip member.
    fn gzip_decoder<'a>(&self, input: Box<dyn BufRead + Send + 'a>) -> Box<dyn Read + Send + 'a>;
}

/// Portable backend on `flate2`; decodes concatenated members, so bgzip files
/// come out as one stream.
pub struct Flate2Backend;

impl DecompressBackend for Flate2Backend {
    fn name(&self) -> &'static str {
        "flate2"
    }

    fn gzip_decoder<'a>(&self, input: Box<dyn BufRead + Send + 'a>) -> Box<dyn Read + Send + 'a> {
        Box::new(MultiGzDecoder::new(input))
    }
}

#[cfg(feature = "libdeflate")]
pub use self::bgzf::LibdeflateBackend;

/// The backend selected for this build.
#[cfg(feature = "libdeflate")]
pub fn default_backend() -> &'static dyn DecompressBackend {
    &LibdeflateBackend
}

/// The backend selected for this build.
#[cfg(not(feature = "libdeflate"))]
pub fn default_backend() -> &'static dyn DecompressBackend {
    &Flate2Backend
}

/// A decoded byte stream plus what is needed to report its failures.
pub struct DecodedInput<'a> {
    pub path: PathBuf,
    pub compressed: bool,
    pub reader: Box<dyn Read + Send + 'a>,
}

impl DecodedInput<'_> {
    /// Maps a read failure on this stream into the error taxonomy.
    pub fn read_error(&self, err: io::Error) -> CountError {
        decode_error(&self.path, self.compressed, err)
    }
}

/// Opens `path` and returns its decoded contents.
pub fn open_input(path: &Path, backend: &dyn DecompressBackend) -> Result<DecodedInput<'static>, CountError> {
    let file = File::open(path).map_err(|e| CountError::io(path, e))?;
    decode_stream(path, BufReader::with_capacity(FILE_BUFFER_SIZE, file), backend)
}

/// Sniffs `input` and wraps it in a decoder when it starts with gzip magic.
pub fn decode_stream<'a, R>(
    path: &Path,
    mut input: R,
    backend: &dyn DecompressBackend,
) -> Result<DecodedInput<'a>, CountError>
where
    R: BufRead + Send + 'a,
{
    let head = input.fill_buf().map_err(|e| CountError::io(path, e))?;
    let compressed = head.starts_with(&GZIP_MAGIC);
    let reader: Box<dyn Read + Send + 'a> = if compressed {
        log::debug!("{}: gzip input, decoding with {}", path.display(), backend.name());
        backend.gzip_decoder(Box::new(input))
    } else {
        Box::new(input)
    };
    Ok(DecodedInput {
        path: path.to_path_buf(),
        compressed,
        reader,
    })
}

/// Errors surfacing from a decoder are split into "cut short" and "corrupt";
/// everything else is plain I/O.
pub fn decode_error(path: &Path, compressed: bool, err: io::Error) -> CountError {
    if !compressed {
        return CountError::io(path, err);
    }
    let kind = match err.kind() {
        io::ErrorKind::UnexpectedEof => DecompressKind::Truncated,
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => DecompressKind::Invalid,
        _ => return CountError::io(path, err),
    };
    CountError::Decompress {
        path: path.to_path_buf(),
        kind,
        detail: err.to_string(),
    }
}

#[cfg(feature = "libdeflate")]
mod bgzf {
    //! BGZF block decoding with libdeflate. Each block carries its own
    //! uncompressed size, so the output buffer is sized exactly and the block
    //! decodes in one call.

    use std::io::{self, BufRead, Read};

    use libdeflater::Decompressor;

    use super::{DecompressBackend, Flate2Backend};

    const HEADER_SIZE: usize = 18;
    const FOOTER_SIZE: usize = 8;

    pub struct LibdeflateBackend;

    impl DecompressBackend for LibdeflateBackend {
        fn name(&self) -> &'static str {
            "libdeflate"
        }

        fn gzip_decoder<'a>(
            &self,
            mut input: Box<dyn BufRead + Send + 'a>,
        ) -> Box<dyn Read + Send + 'a> {
            let is_bgzf = match input.fill_buf() {
                Ok(head) => is_bgzf_header(head),
                Err(_) => false,
            };
            if is_bgzf {
                Box::new(BgzfReader::new(input))
            } else {
                // plain gzip has no block sizes to work with
                Flate2Backend.gzip_decoder(input)
            }
        }
    }

    fn is_bgzf_header(head: &[u8]) -> bool {
        head.len() >= HEADER_SIZE
            && head[0] == 0x1f
            && head[1] == 0x8b
            && head[2] == 0x08
            && head[3] & 0x04 != 0
            && head[12] == b'B'
            && head[13] == b'C'
    }

    fn invalid(msg: String) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, msg)
    }

    /// Fills `buf` completely, or returns how many bytes were read before EOF.
    fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    pub struct BgzfReader<R> {
        inner: R,
        decompressor: Decompressor,
        block: Vec<u8>,
        out: Vec<u8>,
        pos: usize,
        done: bool,
    }

    impl<R: BufRead> BgzfReader<R> {
        pub fn new(inner: R) -> Self {
            Self {
                inner,
                decompressor: Decompressor::new(),
                block: Vec::with_capacity(64 * 1024),
                out: Vec::with_capacity(64 * 1024),
                pos: 0,
                done: false,
            }
        }

        /// Decodes the next block into `out`. Returns false at clean EOF.
        fn next_block(&mut self) -> io::Result<bool> {
            let mut header = [0u8; HEADER_SIZE];
            let got = read_full(&mut self.inner, &mut header)?;
            if got == 0 {
                return Ok(false);
            }
            if got < HEADER_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "BGZF header cut short",
                ));
            }
            if !is_bgzf_header(&header) {
                return Err(invalid(format!(
                    "not a BGZF block header: {:02x?}",
                    &header[..4]
                )));
            }
            let block_size = u16::from_le_bytes([header[16], header[17]]) as usize + 1;
            if block_size < HEADER_SIZE + FOOTER_SIZE {
                return Err(invalid(format!("BGZF block size {block_size} too small")));
            }

            self.block.resize(block_size - HEADER_SIZE, 0);
            let got = read_full(&mut self.inner, &mut self.block)?;
            if got < self.block.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("BGZF block cut short ({got} of {} bytes)", self.block.len()),
                ));
            }

            let footer = &self.block[self.block.len() - FOOTER_SIZE..];
            let crc = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
            let isize = u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]]) as usize;
            let compressed = &self.block[..self.block.len() - FOOTER_SIZE];

            self.out.resize(isize, 0);
            self.pos = 0;
            if isize == 0 {
                return Ok(true);
            }
            let written = self
                .decompressor
                .deflate_decompress(compressed, &mut self.out)
                .map_err(|e| invalid(format!("BGZF block failed to inflate: {e:?}")))?;
            if written != isize {
                return Err(invalid(format!(
                    "BGZF block inflated to {written} bytes, footer says {isize}"
                )));
            }
            if libdeflater::crc32(&self.out) != crc {
                return Err(invalid("BGZF block CRC32 mismatch".to_string()));
            }
            Ok(true)
        }
    }

    impl<R: BufRead> Read for BgzfReader<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            while self.pos >= self.out.len() {
                if self.done || !self.next_block()? {
                    self.done = true;
                    return Ok(0);
                }
            }
            let n = buf.len().min(self.out.len() - self.pos);
            buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

}
