//! Read [MGF](https://www.matrixscience.com/help/data_file_help.html#GEN) files
//! into [`Spectrum`](crate::spectrum::Spectrum) records.
mod reader;

pub use reader::{MGFError, MGFParserState, MGFReader};

pub fn is_mgf(buf: &[u8]) -> bool {
    let needle = b"BEGIN IONS";
    buf.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_is_mgf() {
        assert!(is_mgf(b"COM=x\nBEGIN IONS\n"));
        assert!(!is_mgf(b"Name: x\nNum Peaks: 0\n"));
    }
}
