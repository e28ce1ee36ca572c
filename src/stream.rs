use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use zip::ZipArchive;

use crate::error::EpiError;

pub const GZIP_MAGIC: [u8; 4] = [0x1f, 0x8b, 0x08, 0x00];
const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Plain,
    Gzip,
    Zip,
}

pub fn extension_wants_gzip(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "pack" | "zip" | "gz"))
        .unwrap_or(false)
}

pub fn sniff(head: &[u8], path: Option<&Path>) -> Compression {
    if head.starts_with(&ZIP_MAGIC) {
        return Compression::Zip;
    }
    if head.starts_with(&GZIP_MAGIC) {
        return Compression::Gzip;
    }
    let gzip_family = head.starts_with(&GZIP_MAGIC[..2]);
    if gzip_family && path.map(extension_wants_gzip).unwrap_or(false) {
        return Compression::Gzip;
    }
    Compression::Plain
}

pub struct CountingReader<R> {
    inner: R,
    consumed: Arc<AtomicU64>,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> (Self, Arc<AtomicU64>) {
        let consumed = Arc::new(AtomicU64::new(0));
        (
            Self {
                inner,
                consumed: consumed.clone(),
            },
            consumed,
        )
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.consumed.fetch_add(read as u64, Ordering::Relaxed);
        Ok(read)
    }
}

pub struct OpenedStream {
    pub reader: Box<dyn BufRead + Send>,
    pub length: u64,
    pub consumed: Arc<AtomicU64>,
    pub compression: Compression,
}

pub fn open_file(path: &Path) -> Result<OpenedStream, EpiError> {
    let file = File::open(path).map_err(|err| EpiError::InputRead {
        path: path.display().to_string(),
        message: err.to_string(),
    })?;
    let length = file.metadata().map(|meta| meta.len()).unwrap_or(0);
    let (counting, consumed) = CountingReader::new(file);
    let mut buffered = BufReader::new(counting);
    let head = buffered
        .fill_buf()
        .map_err(|err| EpiError::InputRead {
            path: path.display().to_string(),
            message: err.to_string(),
        })?
        .to_vec();
    let compression = sniff(&head, Some(path));
    let reader = wrap(buffered, compression, path.display().to_string())?;
    Ok(OpenedStream {
        reader,
        length,
        consumed,
        compression,
    })
}

pub fn open_bytes(bytes: Vec<u8>, label: &str) -> Result<OpenedStream, EpiError> {
    let length = bytes.len() as u64;
    let compression = sniff(&bytes, None);
    let (counting, consumed) = CountingReader::new(Cursor::new(bytes));
    let reader = wrap(BufReader::new(counting), compression, label.to_string())?;
    Ok(OpenedStream {
        reader,
        length,
        consumed,
        compression,
    })
}

fn wrap<R>(
    source: R,
    compression: Compression,
    label: String,
) -> Result<Box<dyn BufRead + Send>, EpiError>
where
    R: BufRead + Send + 'static,
{
    match compression {
        Compression::Plain => Ok(Box::new(source)),
        Compression::Gzip => Ok(Box::new(BufReader::new(GzDecoder::new(source)))),
        Compression::Zip => {
            let mut source = source;
            let mut raw = Vec::new();
            source
                .read_to_end(&mut raw)
                .map_err(|err| EpiError::InputRead {
                    path: label.clone(),
                    message: err.to_string(),
                })?;
            let entry = first_zip_entry(raw).map_err(|message| EpiError::InputRead {
                path: label,
                message,
            })?;
            Ok(Box::new(Cursor::new(entry)))
        }
    }
}

fn first_zip_entry(raw: Vec<u8>) -> Result<Vec<u8>, String> {
    let mut archive = ZipArchive::new(Cursor::new(raw)).map_err(|err| err.to_string())?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|err| err.to_string())?;
        if entry.is_dir() {
            continue;
        }
        let mut content = Vec::new();
        io::copy(&mut entry, &mut content).map_err(|err| err.to_string())?;
        return Ok(content);
    }
    Err("zip archive has no file entries".to_string())
}

pub enum StreamWriter<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
}

impl<W: Write> StreamWriter<W> {
    pub fn new(inner: W, gzip: bool) -> Self {
        if gzip {
            StreamWriter::Gzip(GzEncoder::new(inner, GzLevel::default()))
        } else {
            StreamWriter::Plain(inner)
        }
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            StreamWriter::Plain(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
            StreamWriter::Gzip(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for StreamWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StreamWriter::Plain(inner) => inner.write(buf),
            StreamWriter::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            StreamWriter::Plain(inner) => inner.flush(),
            StreamWriter::Gzip(encoder) => encoder.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn sniff_by_magic_and_extension() {
        assert_eq!(sniff(&[0x1f, 0x8b, 0x08, 0x00, 1], None), Compression::Gzip);
        assert_eq!(sniff(b"PK\x03\x04rest", None), Compression::Zip);
        assert_eq!(sniff(b"H;EpiTrend;V1;", None), Compression::Plain);
        let named = PathBuf::from("snapshot.pack");
        assert_eq!(
            sniff(&[0x1f, 0x8b, 0x08, 0x08], Some(&named)),
            Compression::Gzip
        );
        assert_eq!(sniff(&[0x1f, 0x8b, 0x08, 0x08], None), Compression::Plain);
    }

    #[test]
    fn gzip_bytes_are_unwrapped() {
        let mut writer = StreamWriter::new(Vec::new(), true);
        writer.write_all(b"H;EpiTrend;V1;\n").unwrap();
        let bytes = writer.finish().unwrap();
        assert!(bytes.starts_with(&GZIP_MAGIC));

        let mut opened = open_bytes(bytes, "memory").unwrap();
        let mut line = String::new();
        opened.reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim_end(), "H;EpiTrend;V1;");
        assert_eq!(opened.compression, Compression::Gzip);
    }
}
