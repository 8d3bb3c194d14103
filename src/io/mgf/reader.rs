use std::io::{self, prelude::*};

use log::warn;
use thiserror::Error;

use crate::spectrum::{Peak, Spectrum};

#[derive(PartialEq, Debug)]
pub enum MGFParserState {
    Start,
    FileHeader,
    ScanHeaders,
    Peaks,
    Between,
    Done,
    Error,
}

#[derive(Debug, Error)]
pub enum MGFError {
    #[error("No error occurred")]
    NoError,
    #[error("Encountered a malformed peak line on line {0}")]
    MalformedPeakLine(usize),
    #[error("Encountered a malformed header line on line {0}: {1}")]
    MalformedHeaderLine(usize, String),
    #[error("Encountered an IO error: {0}")]
    IOError(
        #[from]
        #[source]
        io::Error,
    ),
}

/// An MGF (Mascot Generic Format) reader producing [`Spectrum`] records.
///
/// Header lines are stored as metadata under their lower-cased key, peak lines
/// are read as `m/z intensity [charge]` with the charge column discarded. A
/// malformed line inside a `BEGIN IONS` block fails that block and reading
/// resumes at the next one.
pub struct MGFReader<R: BufRead> {
    pub handle: R,
    pub state: MGFParserState,
    pub error: Option<MGFError>,
    line_number: usize,
}

impl<R: BufRead> MGFReader<R> {
    pub fn new(handle: R) -> Self {
        Self {
            handle,
            state: MGFParserState::Start,
            error: None,
            line_number: 0,
        }
    }

    fn parse_peak_from_line(&mut self, line: &str, spectrum: &mut Spectrum) -> Option<bool> {
        let first = line.chars().next()?;
        if !first.is_numeric() {
            return None;
        }
        let mut it = line.split_ascii_whitespace();
        let mz = it.next().and_then(|t| t.parse::<f64>().ok());
        let intensity = it.next().and_then(|t| t.parse::<f64>().ok());
        match (mz, intensity) {
            (Some(mz), Some(intensity)) => {
                spectrum.peaks.push(Peak::new(mz, intensity));
                Some(true)
            }
            _ => {
                self.state = MGFParserState::Error;
                self.error = Some(MGFError::MalformedPeakLine(self.line_number));
                Some(false)
            }
        }
    }

    fn handle_scan_header(&mut self, line: &str, spectrum: &mut Spectrum) -> bool {
        if let Some(peak_line) = self.parse_peak_from_line(line, spectrum) {
            if peak_line {
                self.state = MGFParserState::Peaks;
            }
            peak_line
        } else if line == "END IONS" {
            self.state = MGFParserState::Between;
            false
        } else if let Some((key, value)) = line.split_once('=') {
            spectrum.set(key, value);
            true
        } else {
            self.state = MGFParserState::Error;
            self.error = Some(MGFError::MalformedHeaderLine(
                self.line_number,
                "No '=' in header line".into(),
            ));
            false
        }
    }

    fn handle_peak(&mut self, line: &str, spectrum: &mut Spectrum) -> bool {
        match self.parse_peak_from_line(line, spectrum) {
            Some(peak_line) => peak_line,
            None if line == "END IONS" => {
                self.state = MGFParserState::Between;
                false
            }
            None => {
                self.state = MGFParserState::Error;
                self.error = Some(MGFError::MalformedPeakLine(self.line_number));
                false
            }
        }
    }

    fn handle_start(&mut self, line: &str) -> bool {
        if line.contains('=') {
            self.state = MGFParserState::FileHeader;
            true
        } else {
            self.state = MGFParserState::Error;
            self.error = Some(MGFError::MalformedHeaderLine(
                self.line_number,
                "Expected BEGIN IONS or a file header".into(),
            ));
            false
        }
    }

    /// Read the next spectrum from the stream, `Ok(None)` once exhausted.
    pub fn read_next(&mut self) -> Result<Option<Spectrum>, MGFError> {
        let mut spectrum = Spectrum::default();
        let mut buffer = String::new();
        let mut started = false;

        loop {
            if self.state == MGFParserState::Done {
                return Ok(None);
            }
            buffer.clear();
            let b = match self.handle.read_line(&mut buffer) {
                Ok(b) => b,
                Err(err) => {
                    self.state = MGFParserState::Error;
                    return Err(MGFError::IOError(err));
                }
            };
            self.line_number += 1;
            if b == 0 {
                if started {
                    warn!("MGF stream ended inside a spectrum block, discarding it");
                }
                self.state = MGFParserState::Done;
                return Ok(None);
            }

            let line = buffer.trim();
            if line.is_empty() {
                continue;
            }

            match self.state {
                MGFParserState::Start | MGFParserState::FileHeader | MGFParserState::Between => {
                    if line == "BEGIN IONS" {
                        self.state = MGFParserState::ScanHeaders;
                        started = true;
                    } else if matches!(self.state, MGFParserState::Between) {
                        // Text between blocks is ignored
                    } else {
                        self.handle_start(line);
                    }
                }
                MGFParserState::ScanHeaders => {
                    self.handle_scan_header(line, &mut spectrum);
                }
                MGFParserState::Peaks => {
                    self.handle_peak(line, &mut spectrum);
                }
                MGFParserState::Done => return Ok(None),
                MGFParserState::Error => {}
            }

            if self.state == MGFParserState::Error {
                // A bad line inside a block costs that block only
                if started {
                    self.state = MGFParserState::Between;
                }
                return Err(self.error.take().unwrap_or(MGFError::NoError));
            }
            if started && self.state == MGFParserState::Between {
                return Ok(Some(spectrum));
            }
        }
    }
}

impl<R: BufRead> Iterator for MGFReader<R> {
    type Item = Result<Spectrum, MGFError>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.state, MGFParserState::Error) {
            return None;
        }
        self.read_next().transpose()
    }
}
