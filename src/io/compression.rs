use std::fs;
use std::io::{self, prelude::*};
use std::path;

use flate2::read::MultiGzDecoder;

pub fn is_gzipped(header: &[u8]) -> bool {
    header.starts_with(b"\x1f\x8b")
}

pub fn is_gzipped_extension(path: path::PathBuf) -> (bool, path::PathBuf) {
    if let Some(ext) = path.extension() {
        if ext.to_ascii_lowercase() == "gz" {
            (true, path.with_extension(""))
        } else {
            (false, path)
        }
    } else {
        (false, path)
    }
}

/// Open `path` for buffered reading, transparently decompressing it if the
/// leading bytes carry the gzip magic number. The extension is not trusted.
pub fn open_maybe_gzipped<P: AsRef<path::Path>>(path: P) -> io::Result<Box<dyn BufRead + Send>> {
    let mut handle = io::BufReader::new(fs::File::open(path.as_ref())?);
    let gzipped = is_gzipped(handle.fill_buf()?);
    if gzipped {
        Ok(Box::new(io::BufReader::new(MultiGzDecoder::new(handle))))
    } else {
        Ok(Box::new(handle))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::{write::GzEncoder, Compression};

    #[test]
    fn test_open_gzipped() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("corpus.txt.gz");
        let mut enc = GzEncoder::new(fs::File::create(&path)?, Compression::default());
        enc.write_all(b"Name: caffeine\n")?;
        enc.finish()?;

        let mut text = String::new();
        open_maybe_gzipped(&path)?.read_to_string(&mut text)?;
        assert_eq!(text, "Name: caffeine\n");

        let (gz, stem) = is_gzipped_extension(path.clone());
        assert!(gz);
        assert_eq!(stem.file_name().unwrap(), "corpus.txt");
        Ok(())
    }
}
