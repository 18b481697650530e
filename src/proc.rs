use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::{Parser, ValueEnum};
use tokio::{io::AsyncRead, sync::Mutex};
use tokio_serial::SerialStream;
use tracing::{Level, info};

use crate::{
    metrics::{Collection, MetricClassifier},
    registry::FieldRegistry,
    teleinfo::{FrameDecoder, FrameTimeouts, Teleinfo, TeleinfoError},
};

/// Teleinfo mode of the meter
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum TeleinfoMode {
    /// _historical_ Teleinfo format
    #[value(name = "HISTORIQUE")]
    Historique,
    /// _standard_ Teleinfo format
    #[value(name = "STANDARD")]
    Standard,
}

impl TeleinfoMode {
    /// Baud rate of the serial line for the mode
    pub fn baud_rate(&self) -> u32 {
        match self {
            TeleinfoMode::Historique => 1200,
            TeleinfoMode::Standard => 9600,
        }
    }
}

impl fmt::Display for TeleinfoMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TeleinfoMode::Historique => write!(f, "HISTORIQUE"),
            TeleinfoMode::Standard => write!(f, "STANDARD"),
        }
    }
}

/// Settings for the Teleinfo exporter
#[derive(Debug, Clone, Parser)]
#[command(
    name = "teleinfo-exporter",
    version,
    about = "Prometheus exporter for Enedis Linky Teleinfo"
)]
pub struct TeleinfoSettings {
    /// Path of the serial that is connected to the Teleinfo Enedis counter output (try to detect the path with the first serial port connected)
    #[arg(long = "interface", env = "LINKY_EXPORTER_INTERFACE")]
    serial_path: Option<String>,
    /// Teleinfo mode of the meter
    #[arg(long, env = "LINKY_EXPORTER_MODE", value_enum, ignore_case = true, default_value_t = TeleinfoSettings::default_mode())]
    mode: TeleinfoMode,
    /// Maximum duration to read a complete frame (seconds)
    #[arg(long, env = "LINKY_FRAME_TIMEOUT", value_parser = clap::value_parser!(u64).range(1..), default_value_t = TeleinfoSettings::default_frame_timeout())]
    frame_timeout: u64,
    /// Maximum duration to wait for a frame start (seconds)
    #[arg(long, env = "LINKY_START_TIMEOUT", value_parser = clap::value_parser!(u64).range(1..), default_value_t = TeleinfoSettings::default_start_timeout())]
    start_timeout: u64,
    /// Name of the exporter service, exported as `job` label
    #[arg(long, env = "LINKY_EXPORTER_NAME", default_value_t = TeleinfoSettings::default_name())]
    name: String,
    /// Prefix of the metric names
    #[arg(long, env = "LINKY_EXPORTER_PREFIX", default_value_t = TeleinfoSettings::default_prefix())]
    prefix: String,
    /// Listening address of the HTTP server
    #[arg(long, env = "LINKY_EXPORTER_ADDRESS", default_value_t = TeleinfoSettings::default_address())]
    address: IpAddr,
    /// Listening port of the HTTP server
    #[arg(long, env = "LINKY_EXPORTER_PORT", default_value_t = TeleinfoSettings::default_port())]
    port: u16,
    /// Maximum log level
    #[arg(long, env = "LINKY_EXPORTER_LOGLEVEL", default_value_t = TeleinfoSettings::default_log_level())]
    log_level: Level,
}

impl TeleinfoSettings {
    fn default_mode() -> TeleinfoMode {
        TeleinfoMode::Historique
    }

    fn default_frame_timeout() -> u64 {
        10
    }

    fn default_start_timeout() -> u64 {
        10
    }

    fn default_name() -> String {
        String::from("linky-exporter")
    }

    fn default_prefix() -> String {
        String::from("linky")
    }

    fn default_address() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    fn default_port() -> u16 {
        8123
    }

    fn default_log_level() -> Level {
        Level::INFO
    }

    /// Getter of the serial UART address
    pub fn get_serial_path(&self) -> Result<String, tokio_serial::Error> {
        if let Some(path) = &self.serial_path {
            Ok(path.clone())
        } else if let Some(info) = tokio_serial::available_ports()?.first() {
            Ok(info.port_name.clone())
        } else {
            Err(tokio_serial::Error::new(
                tokio_serial::ErrorKind::NoDevice,
                "No serial port available for Teleinfo",
            ))
        }
    }

    pub fn mode(&self) -> TeleinfoMode {
        self.mode
    }

    /// Maximum duration to read a complete frame
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_timeout)
    }

    pub fn timeouts(&self) -> FrameTimeouts {
        FrameTimeouts {
            start: Duration::from_secs(self.start_timeout),
            frame: self.frame_timeout(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Address of the HTTP server
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn log_level(&self) -> Level {
        self.log_level
    }
}

impl Default for TeleinfoSettings {
    fn default() -> Self {
        TeleinfoSettings {
            serial_path: None,
            mode: Self::default_mode(),
            frame_timeout: Self::default_frame_timeout(),
            start_timeout: Self::default_start_timeout(),
            name: Self::default_name(),
            prefix: Self::default_prefix(),
            address: Self::default_address(),
            port: Self::default_port(),
            log_level: Self::default_log_level(),
        }
    }
}

/// Teleinfo processor that gather the meter metrics on demand
#[derive(Debug)]
pub struct TeleinfoProc<S = SerialStream> {
    settings: TeleinfoSettings,
    registry: FieldRegistry,
    teleinfo: Mutex<Teleinfo<S>>,
}

impl TeleinfoProc<SerialStream> {
    /// Open the serial of the meter and wait for its first Teleinfo data
    pub async fn open(
        settings: TeleinfoSettings,
        registry: FieldRegistry,
    ) -> Result<TeleinfoProc<SerialStream>, TeleinfoError> {
        let mut teleinfo = Teleinfo::new(&settings)?;
        teleinfo
            .handshake(&registry, settings.frame_timeout())
            .await?;
        info!("Teleinfo meter ready in {} mode", settings.mode());

        Ok(TeleinfoProc::new(settings, registry, teleinfo))
    }
}

impl<S> TeleinfoProc<S>
where
    S: AsyncRead + Unpin,
{
    pub fn new(
        settings: TeleinfoSettings,
        registry: FieldRegistry,
        teleinfo: Teleinfo<S>,
    ) -> TeleinfoProc<S> {
        TeleinfoProc {
            settings,
            registry,
            teleinfo: Mutex::new(teleinfo),
        }
    }

    pub fn settings(&self) -> &TeleinfoSettings {
        &self.settings
    }

    /// Read a fresh frame from the meter and classify its fields.
    /// Concurrent calls wait for each other.
    pub async fn collect(&self) -> Result<Collection, TeleinfoError> {
        let frame = {
            let mut teleinfo = self.teleinfo.lock().await;
            FrameDecoder::new(&self.registry, self.settings.timeouts())
                .decode(&mut *teleinfo)
                .await?
        };
        info!("Frame : {}", frame);

        MetricClassifier::new(&self.registry, self.settings.prefix(), self.settings.name())
            .classify(&frame)
    }
}
