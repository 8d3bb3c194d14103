//! Read NIST MSP text libraries, the format MassBank publishes its full
//! release in.
//!
//! A record is a block of `Key: value` header lines, a `Num Peaks: N` line and
//! then peak lines. Peak lines hold `m/z intensity` pairs, optionally several
//! per line separated by `;`, optionally followed by a quoted annotation.
//! Records end at a blank line, at the next `Name:` line or at end of stream.
//! A malformed record is reported once and the reader then resumes at the
//! next record; only IO errors end iteration.
use std::io::{self, prelude::*};

use thiserror::Error;

use crate::spectrum::{Peak, Spectrum};

#[derive(PartialEq, Debug)]
pub enum MSPParserState {
    Between,
    Headers,
    Peaks,
    /// Discarding the rest of a malformed record
    Skipping,
    Done,
    Error,
}

#[derive(Debug, Error)]
pub enum MSPError {
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

pub struct MSPReader<R: BufRead> {
    pub handle: R,
    pub state: MSPParserState,
    line_number: usize,
    pending: Option<String>,
}

fn is_name_line(line: &str) -> bool {
    line.split_once(':')
        .map(|(k, _)| k.trim().eq_ignore_ascii_case("name"))
        .unwrap_or(false)
}

fn parse_peak_chunk(chunk: &str) -> Option<Peak> {
    let mut tokens = chunk
        .split(|c: char| c.is_ascii_whitespace() || c == ',')
        .filter(|t| !t.is_empty());
    let mz = tokens.next()?.parse().ok()?;
    let intensity = tokens.next()?.parse().ok()?;
    Some(Peak::new(mz, intensity))
}

impl<R: BufRead> MSPReader<R> {
    pub fn new(handle: R) -> Self {
        Self {
            handle,
            state: MSPParserState::Between,
            line_number: 0,
            pending: None,
        }
    }

    fn next_line(&mut self, buffer: &mut String) -> io::Result<usize> {
        buffer.clear();
        if let Some(line) = self.pending.take() {
            buffer.push_str(&line);
            return Ok(line.len().max(1));
        }
        let b = self.handle.read_line(buffer)?;
        self.line_number += 1;
        Ok(b)
    }

    fn parse_peak_line(&mut self, line: &str, spectrum: &mut Spectrum) -> Result<(), MSPError> {
        let stripped = match line.find('"') {
            Some(i) => &line[..i],
            None => line,
        };
        for chunk in stripped.split(';').map(str::trim).filter(|c| !c.is_empty()) {
            match parse_peak_chunk(chunk) {
                Some(peak) => spectrum.peaks.push(peak),
                None => {
                    self.state = MSPParserState::Skipping;
                    return Err(MSPError::MalformedPeakLine(self.line_number));
                }
            }
        }
        Ok(())
    }

    fn parse_header_line(&mut self, line: &str, spectrum: &mut Spectrum) -> Result<(), MSPError> {
        match line.split_once(':') {
            Some((key, value)) => {
                let key = key.trim();
                if key.eq_ignore_ascii_case("num peaks") {
                    self.state = MSPParserState::Peaks;
                }
                spectrum.set(key, value);
                Ok(())
            }
            None => {
                self.state = MSPParserState::Skipping;
                Err(MSPError::MalformedHeaderLine(
                    self.line_number,
                    format!("No ':' in header line {line:?}"),
                ))
            }
        }
    }

    /// Read the next record, `Ok(None)` once the stream is exhausted.
    pub fn read_next(&mut self) -> Result<Option<Spectrum>, MSPError> {
        let mut spectrum = Spectrum::default();
        let mut started = false;
        let mut buffer = String::new();

        loop {
            match self.state {
                MSPParserState::Done | MSPParserState::Error => return Ok(None),
                _ => {}
            }
            let b = match self.next_line(&mut buffer) {
                Ok(b) => b,
                Err(e) => {
                    self.state = MSPParserState::Error;
                    return Err(e.into());
                }
            };
            if b == 0 {
                self.state = MSPParserState::Done;
                return Ok(started.then_some(spectrum));
            }
            let line = buffer.trim();

            if self.state == MSPParserState::Skipping {
                if line.is_empty() {
                    self.state = MSPParserState::Between;
                } else if is_name_line(line) {
                    self.pending = Some(line.to_string());
                    self.state = MSPParserState::Between;
                }
                continue;
            }

            if line.is_empty() {
                if started {
                    self.state = MSPParserState::Between;
                    return Ok(Some(spectrum));
                }
                continue;
            }

            match self.state {
                MSPParserState::Between => {
                    started = true;
                    self.state = MSPParserState::Headers;
                    self.parse_header_line(line, &mut spectrum)?;
                }
                MSPParserState::Headers => {
                    if line.starts_with(|c: char| c.is_ascii_digit()) && !line.contains(':') {
                        self.state = MSPParserState::Peaks;
                        self.parse_peak_line(line, &mut spectrum)?;
                    } else {
                        self.parse_header_line(line, &mut spectrum)?;
                    }
                }
                MSPParserState::Peaks => {
                    if is_name_line(line) {
                        self.pending = Some(line.to_string());
                        self.state = MSPParserState::Between;
                        return Ok(Some(spectrum));
                    }
                    self.parse_peak_line(line, &mut spectrum)?;
                }
                MSPParserState::Skipping | MSPParserState::Done | MSPParserState::Error => {
                    return Ok(None)
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for MSPReader<R> {
    type Item = Result<Spectrum, MSPError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}
