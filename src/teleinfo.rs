//! Teleinfo module to decode the meter frames
//!
//! A historical Teleinfo frame is a sequence of groups `<LF>TAG<SP>VALUE<SP>CHECKSUM<CR>`
//! surrounded by STX (0x02) and ETX (0x03).
//! Read by line (LF terminated), the last group of a frame is followed by the ETX of the frame and the STX of the next one.
use std::{fmt, io, time::Duration};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time::{Instant, timeout_at},
};
use tokio_serial::{SerialPortBuilderExt as _, SerialStream};
use tracing::{debug, warn};

use crate::{
    proc::TeleinfoSettings,
    registry::{FieldRegistry, Tag},
};

/// Start of a Teleinfo frame
pub const STX: u8 = 0x02;
/// End of a Teleinfo frame
pub const ETX: u8 = 0x03;
const LF: u8 = 0x0A;
const CR: u8 = 0x0D;
const SP: u8 = 0x20;

/// Phase of the frame decoding
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FramePhase {
    /// Waiting for the STX of a new frame
    Start,
    /// Waiting for the ETX of the current frame
    End,
}

impl fmt::Display for FramePhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FramePhase::Start => write!(f, "frame start"),
            FramePhase::End => write!(f, "frame end"),
        }
    }
}

/// Teleinfo error definition
#[derive(Error, Debug)]
pub enum TeleinfoError {
    /// Line that is not a tag, a value and a checksum
    #[error("Malformed line `{0}`")]
    MalformedLine(String),
    /// Wrong checksum
    #[error("Wrong checksum `{0}`, expected `{1}` for `{2}`")]
    WrongChecksum(String, char, String),
    /// No frame received in time
    #[error("No Teleinfo {0} received within {1:?}")]
    FrameTimeout(FramePhase, Duration),
    /// The meter can't be reached
    #[error("Teleinfo device unavailable: {0}")]
    DeviceUnavailable(String),
    /// Numerical field that contain something else
    #[error("Can't parse numerical value `{1}` of `{0}`")]
    MetricValue(String, String),
    /// Serial Error
    #[error("Serial error `{0}`")]
    SerialErr(#[from] tokio_serial::Error),
    /// Other IO error
    #[error("IO error `{0}`")]
    IoErr(#[from] io::Error),
    /// Metric exposition error
    #[error("Metrics error `{0}`")]
    MetricsErr(#[from] prometheus::Error),
}

impl TeleinfoError {
    /// Recoverable errors only concern a line. The frame is dropped and the decoder wait for the next one.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            TeleinfoError::MalformedLine(_) | TeleinfoError::WrongChecksum(_, _, _)
        )
    }
}

/// Sum the characters of a Teleinfo data
pub fn checksum_sum(data: &str) -> u64 {
    data.chars().map(|c| c as u64).sum()
}

/// Checksum character from the sum of the checked data: `(S1 & 0x3F) + 0x20`
pub fn checksum_char(sum: u64) -> char {
    char::from((sum & 0x3F) as u8 + 0x20)
}

/// Compute the checksum of a tag and its value (`TAG<SP>VALUE`)
///
/// It's a modular sum. It catches transmission errors, not tampered data.
pub fn checksum(tag: &str, value: &str) -> char {
    checksum_char(checksum_sum(tag) + SP as u64 + checksum_sum(value))
}

/// Verify the checksum supplied with a tag and its value
pub fn verify_checksum(tag: &str, value: &str, supplied: &str) -> bool {
    let mut chars = supplied.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c == checksum(tag, value))
}

/// Teleinfo line data (tag, value, checksum)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeleinfoLine {
    pub tag: String,
    pub value: String,
    pub checksum: String,
}

impl TeleinfoLine {
    /// Split a raw line into its tag, value and checksum
    ///
    /// The group ends at the first CR (or LF). A SP checksum leaves an empty token after the split, it's restored as a SP.
    pub fn parse(raw: &[u8]) -> Result<TeleinfoLine, TeleinfoError> {
        let end = raw
            .iter()
            .position(|b| *b == CR || *b == LF)
            .unwrap_or(raw.len());
        let text = String::from_utf8_lossy(&raw[..end]);

        let mut tokens: Vec<&str> = text.split(SP as char).collect();
        // `TAG<SP>VALUE<SP><SP>`: separator followed by a SP checksum
        if tokens.len() == 4 && tokens[2].is_empty() && tokens[3].is_empty() {
            tokens.pop();
        }

        if tokens.len() != 3 {
            return Err(TeleinfoError::MalformedLine(text.to_string()));
        }

        let checksum = if tokens[2].is_empty() { " " } else { tokens[2] };
        Ok(TeleinfoLine {
            tag: tokens[0].to_string(),
            value: tokens[1].to_string(),
            checksum: checksum.to_string(),
        })
    }

    /// Verify the line checksum. The label sum of known tags come from the registry.
    pub fn verify(&self, registry: &FieldRegistry) -> Result<(), TeleinfoError> {
        let label_sum = registry
            .lookup(&self.tag)
            .map(|field| field.label_checksum)
            .unwrap_or_else(|| checksum_sum(&self.tag));
        let expected = checksum_char(label_sum + SP as u64 + checksum_sum(&self.value));

        let mut chars = self.checksum.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c == expected => Ok(()),
            _ => Err(TeleinfoError::WrongChecksum(
                self.checksum.clone(),
                expected,
                self.tag.clone(),
            )),
        }
    }
}

/// Complete Teleinfo frame, restricted to the registry tags
///
/// Fields keep their reception order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeleinfoFrame {
    fields: Vec<(Tag, String)>,
}

impl TeleinfoFrame {
    /// Set the value of a tag. A tag received twice keep its place with the last value.
    pub fn insert(&mut self, tag: Tag, value: String) -> Option<String> {
        if let Some((_, old)) = self.fields.iter_mut().find(|(t, _)| *t == tag) {
            Some(std::mem::replace(old, value))
        } else {
            self.fields.push((tag, value));
            None
        }
    }

    pub fn get(&self, tag: Tag) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tag, &str)> {
        self.fields.iter().map(|(tag, value)| (*tag, value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(Tag, String)> for TeleinfoFrame {
    fn from_iter<I: IntoIterator<Item = (Tag, String)>>(iter: I) -> Self {
        let mut frame = TeleinfoFrame::default();
        for (tag, value) in iter {
            frame.insert(tag, value);
        }

        frame
    }
}

impl fmt::Display for TeleinfoFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for (idx, (tag, value)) in self.fields.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{tag}: {value}")?;
        }
        write!(f, "}}")
    }
}

/// Time bounds of a frame decoding
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameTimeouts {
    /// Bound of every wait for a frame start (STX)
    pub start: Duration,
    /// Bound of the whole frame decoding
    pub frame: Duration,
}

impl Default for FrameTimeouts {
    fn default() -> Self {
        FrameTimeouts {
            start: Duration::from_secs(10),
            frame: Duration::from_secs(10),
        }
    }
}

fn device_unavailable(serial_path: &str, err: tokio_serial::Error) -> TeleinfoError {
    TeleinfoError::DeviceUnavailable(format!("{serial_path}: {err}"))
}

/// Structure to handle the teleinfo communication
#[derive(Debug)]
pub struct Teleinfo<S = SerialStream> {
    serial: S,
    serial_buffer: BytesMut,
}

impl Teleinfo<SerialStream> {
    /// Method to initiate a serial connection and open it
    pub fn new(settings: &TeleinfoSettings) -> Result<Teleinfo<SerialStream>, TeleinfoError> {
        let serial_path = settings
            .get_serial_path()
            .map_err(|e| TeleinfoError::DeviceUnavailable(e.to_string()))?;
        let serial_config = tokio_serial::new(serial_path.as_str(), settings.mode().baud_rate())
            .data_bits(tokio_serial::DataBits::Seven)
            .flow_control(tokio_serial::FlowControl::Hardware)
            .parity(tokio_serial::Parity::Even)
            .stop_bits(tokio_serial::StopBits::One)
            .timeout(Duration::from_millis(2000));

        debug!("Try to open tokio serial {:?}", serial_config);

        let mut serial = serial_config
            .open_native_async()
            .map_err(|e| device_unavailable(&serial_path, e))?;
        // Only one reader on the meter
        serial
            .set_exclusive(true)
            .map_err(|e| device_unavailable(&serial_path, e))?;
        debug!("Ok to open tokio serial {:?}", serial);

        Ok(Teleinfo::with_stream(serial))
    }
}

impl<S> Teleinfo<S>
where
    S: AsyncRead + Unpin,
{
    /// Handle Teleinfo from any byte stream
    pub fn with_stream(serial: S) -> Teleinfo<S> {
        Teleinfo {
            serial,
            serial_buffer: BytesMut::with_capacity(2048),
        }
    }

    /// Method to read a line (LF included).
    /// Return `None` if the deadline is reached before the end of the line.
    pub async fn read_line(&mut self, deadline: Instant) -> Result<Option<Bytes>, TeleinfoError> {
        loop {
            if let Some(pos) = self.serial_buffer.iter().position(|b| *b == LF) {
                return Ok(Some(self.serial_buffer.split_to(pos + 1).freeze()));
            }

            match timeout_at(deadline, self.serial.read_buf(&mut self.serial_buffer)).await {
                Ok(Ok(0)) => {
                    return Err(TeleinfoError::IoErr(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "Read EOF on teleinfo serial",
                    )));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(None),
            }
        }
    }

    /// Wait for a known Teleinfo label to make sure that the meter talk on the stream
    pub async fn handshake(
        &mut self,
        registry: &FieldRegistry,
        timeout: Duration,
    ) -> Result<(), TeleinfoError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.read_line(deadline).await {
                Ok(Some(line)) if registry.contains_known_label(&line) => {
                    debug!("Teleinfo meter detected");
                    return Ok(());
                }
                Ok(Some(line)) => debug!("Not a Teleinfo line {:?}", line),
                Ok(None) => {
                    return Err(TeleinfoError::DeviceUnavailable(format!(
                        "no Teleinfo label received within {timeout:?}"
                    )));
                }
                Err(e) => return Err(TeleinfoError::DeviceUnavailable(e.to_string())),
            }
        }
    }
}

enum DecoderState {
    SeekingStart(Instant),
    Accumulating(TeleinfoFrame),
}

/// Decoder of complete Teleinfo frames
///
/// Every call starts from the current position of the stream and waits for a new frame start.
/// Malformed lines drop the current frame, the decoder then waits for the next frame start.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder<'a> {
    registry: &'a FieldRegistry,
    timeouts: FrameTimeouts,
}

impl<'a> FrameDecoder<'a> {
    pub fn new(registry: &'a FieldRegistry, timeouts: FrameTimeouts) -> FrameDecoder<'a> {
        FrameDecoder { registry, timeouts }
    }

    fn start_deadline(&self, frame_deadline: Instant) -> Instant {
        (Instant::now() + self.timeouts.start).min(frame_deadline)
    }

    /// Add a line to the frame. Return `true` when the line close the frame
    fn accumulate(&self, frame: &mut TeleinfoFrame, raw: &[u8]) -> Result<bool, TeleinfoError> {
        let line = TeleinfoLine::parse(raw)?;
        line.verify(self.registry)?;

        debug!("{} : {}", line.tag, line.value);
        if let Some(field) = self.registry.lookup(&line.tag) {
            frame.insert(field.tag, line.value);
        }

        Ok(raw.windows(2).any(|w| w == [ETX, STX]))
    }

    /// Method to read a complete Teleinfo frame
    pub async fn decode<S>(&self, teleinfo: &mut Teleinfo<S>) -> Result<TeleinfoFrame, TeleinfoError>
    where
        S: AsyncRead + Unpin,
    {
        let frame_deadline = Instant::now() + self.timeouts.frame;
        let mut state = DecoderState::SeekingStart(self.start_deadline(frame_deadline));
        loop {
            state = match state {
                DecoderState::SeekingStart(deadline) => {
                    let line = teleinfo.read_line(deadline).await?.ok_or(
                        TeleinfoError::FrameTimeout(
                            FramePhase::Start,
                            self.timeouts.start.min(self.timeouts.frame),
                        ),
                    )?;

                    if line.contains(&STX) {
                        debug!("Teleinfo frame start");
                        DecoderState::Accumulating(TeleinfoFrame::default())
                    } else {
                        debug!("Wait for new Teleinfo frame");
                        DecoderState::SeekingStart(deadline)
                    }
                }
                DecoderState::Accumulating(mut frame) => {
                    let line = teleinfo.read_line(frame_deadline).await?.ok_or(
                        TeleinfoError::FrameTimeout(FramePhase::End, self.timeouts.frame),
                    )?;

                    match self.accumulate(&mut frame, &line) {
                        Ok(true) => {
                            debug!("Teleinfo frame end");
                            return Ok(frame);
                        }
                        Ok(false) => DecoderState::Accumulating(frame),
                        Err(e) if e.recoverable() => {
                            warn!("Wrong teleinfo line: {}", e);
                            DecoderState::SeekingStart(self.start_deadline(frame_deadline))
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}
