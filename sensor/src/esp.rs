use core::{cell::RefCell, convert::TryInto};
use std::{fs::File, io, net::Ipv4Addr, thread, time::Duration};

use anyhow::anyhow;
use embedded_graphics::{
    mono_font::{
        iso_8859_1::{FONT_10X20, FONT_6X10},
        MonoFont, MonoTextStyle,
    },
    pixelcolor::BinaryColor,
    prelude::*,
    primitives::{PrimitiveStyle, Rectangle},
    text::{Alignment, Baseline, Text, TextStyleBuilder},
};
use embedded_hal_bus::i2c::RefCellDevice;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::FreeRtos,
    gpio::AnyIOPin,
    i2c::{I2cConfig, I2cDriver},
    prelude::*,
    sd::{
        mmc::{SdMmcHostConfiguration, SdMmcHostDriver},
        SdCardConfiguration, SdCardDriver,
    },
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    fs::fatfs::Fatfs,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    io::vfs::MountedFatfs,
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::{EspOta, EspOtaUpdate},
    wifi::EspWifi,
};
use log::{debug, info, warn};
use serde::Serialize;
use ssd1306::{mode::BufferedGraphicsMode, prelude::*, I2CDisplayInterface, Ssd1306};

use rssi_logger_common::{
    config::DEFAULT_HOSTNAME,
    display::{
        connecting_text, humidity_text, link_text, progress_text, signal_text, temperature_text,
        wrap_lines, MSG_CONNECTED, MSG_LOGGING_DISABLED,
    },
    update::{SHA256_HEADER, TOKEN_HEADER},
    Clock, ConnectivityManager, DeviceConfig, DirVolume, Hte501, LinkInfo, MonotonicClock,
    MountError, NetworkConfig, Presenter, Radio, RadioError, RestartReason, SampleLoop,
    StorageLogger, UpdateError, UpdateListener, UpdatePoll, UpdateRequest, UpdateSink,
    UpdateSummary, UpdateTracker, Volume,
};

const NVS_NAMESPACE: &str = "rssi_logger";
const NVS_CONFIG_KEY: &str = "device_json";

const SD_MOUNT_POINT: &str = "/sdcard";
const SD_MAX_OPEN_FILES: usize = 4;
const OTA_CHUNK_SIZE: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;

const PANEL_WIDTH: i32 = 128;
const PANEL_COLUMNS: usize = 21;
const LINE_HEIGHT: i32 = 10;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut config = load_device_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load device config from NVS: {err:#}");
        DeviceConfig::default()
    });
    apply_build_defaults(&mut config);

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    // Panel and sensor share one bus: SDA on GPIO16, SCL on GPIO1.
    let i2c = I2cDriver::new(
        peripherals.i2c0,
        pins.gpio16,
        pins.gpio1,
        &I2cConfig::new().baudrate(400.kHz().into()),
    )?;
    let bus = RefCell::new(i2c);

    let mut presenter = OledPresenter::new(I2CDisplayInterface::new(RefCellDevice::new(&bus)));
    let mut sensor = Hte501::new(RefCellDevice::new(&bus), FreeRtos);
    let mut clock = MonotonicClock::new();

    // 4-bit SDMMC: CMD GPIO35, CLK GPIO36, D0..D3 on GPIO37, 38, 33, 34.
    let card = SdMmcHostDriver::new_4bits(
        peripherals.sdmmc1,
        pins.gpio35,
        pins.gpio36,
        pins.gpio37,
        pins.gpio38,
        pins.gpio33,
        pins.gpio34,
        None::<AnyIOPin>,
        None::<AnyIOPin>,
        &SdMmcHostConfiguration::new(),
    )
    .and_then(|host| SdCardDriver::new_mmc(host, &SdCardConfiguration::new()));
    let volume = CardVolume::probe(card);

    let mut storage = if config.storage.enabled {
        StorageLogger::new(volume, &config.storage.log_path)
    } else {
        presenter.show_status(MSG_LOGGING_DISABLED);
        StorageLogger::disabled(volume, &config.storage.log_path)
    };
    storage.prepare(&mut presenter);
    clock.delay_ms(config.timing.notice_hold_ms);

    let wifi = EspWifi::new(peripherals.modem, sys_loop, Some(nvs_partition))?;
    let radio = WifiRadio { wifi };
    let listener = OtaUpdateListener::new(config.update.listen_port);

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let mut connectivity =
        ConnectivityManager::new(radio, listener, config.network.clone(), &config.timing);

    let reason = match connectivity.connect(&mut clock, &mut presenter) {
        Ok(_) => {
            mark_running_slot_valid();
            let mut sampler =
                SampleLoop::new(connectivity, storage, &config.timing, clock.now_ms());
            sampler.run(&mut clock, &mut sensor, &mut presenter, feed_watchdog)
        }
        Err(reason) => reason,
    };

    warn!("restarting: {reason}");
    thread::sleep(Duration::from_millis(config.timing.restart_delay_ms.into()));
    unsafe { esp_idf_svc::sys::esp_restart() }
}

fn load_device_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<DeviceConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 2048];

    match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
        Some(value) => Ok(DeviceConfig::from_json(value)?),
        None => Ok(DeviceConfig::default()),
    }
}

/// Network identity baked in at build time fills whatever NVS left empty.
fn apply_build_defaults(config: &mut DeviceConfig) {
    let network = &mut config.network;
    if network.ssid.is_empty() {
        network.ssid = option_env!("WIFI_SSID").unwrap_or_default().to_string();
    }
    if network.credential.is_empty() {
        network.credential = option_env!("WIFI_KEY").unwrap_or_default().to_string();
    }
    if network.update_auth_token.is_empty() {
        network.update_auth_token = option_env!("OTA_AUTH").unwrap_or_default().to_string();
    }
    if let Some(hostname) = option_env!("HOSTNAME") {
        if network.hostname.is_empty() || network.hostname == DEFAULT_HOSTNAME {
            network.hostname = hostname.to_string();
        }
    }
    config.sanitize();

    if !config.network.has_station_credentials() {
        warn!("no wifi ssid configured; association will fail and the device will restart");
    }
}

struct WifiRadio {
    wifi: EspWifi<'static>,
}

impl WifiRadio {
    fn ap_record(&self) -> Option<esp_idf_svc::sys::wifi_ap_record_t> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info)
    }
}

impl Radio for WifiRadio {
    fn begin(&mut self, network: &NetworkConfig) -> Result<(), RadioError> {
        let driver = |err: esp_idf_svc::sys::EspError| RadioError::Driver(err.to_string());

        let auth_method = if network.credential.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: network
                    .ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| RadioError::Config("wifi ssid too long".to_string()))?,
                password: network
                    .credential
                    .as_str()
                    .try_into()
                    .map_err(|_| RadioError::Config("wifi key too long".to_string()))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(driver)?;

        if let Err(err) = self.wifi.sta_netif_mut().set_hostname(&network.hostname) {
            warn!("failed to set hostname `{}`: {err}", network.hostname);
        }

        if !self.wifi.is_started().map_err(driver)? {
            self.wifi.start().map_err(driver)?;
            disable_wifi_power_save();
        }
        self.wifi.connect().map_err(driver)
    }

    fn is_associated(&mut self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            debug!("wifi disconnect: {err}");
        }
    }

    fn rssi(&mut self) -> i8 {
        self.ap_record().map(|ap| ap.rssi).unwrap_or(0)
    }

    fn link_info(&mut self) -> LinkInfo {
        let ip = match self.wifi.sta_netif().get_ip_info() {
            Ok(info) => info.ip,
            Err(err) => {
                warn!("failed to read station ip: {err}");
                Ipv4Addr::UNSPECIFIED
            }
        };
        let channel = self.ap_record().map(|ap| ap.primary).unwrap_or(0);
        LinkInfo { ip, channel }
    }
}

/// FAT volume on the SD card, mounted into the VFS once at boot. The probe
/// result is replayed to the storage logger on `mount`.
struct CardVolume<M> {
    _mounted: Option<M>,
    failure: Option<MountError>,
    dir: DirVolume,
}

impl CardVolume<MountedFatfs<Fatfs<SdCardDriver<SdMmcHostDriver<'static>>>>> {
    fn probe(
        card: Result<SdCardDriver<SdMmcHostDriver<'static>>, esp_idf_svc::sys::EspError>,
    ) -> Self {
        let mounted = card
            .map_err(|err| {
                warn!("sd card not detected: {err}");
                MountError::NoCard
            })
            .and_then(|card| {
                Fatfs::new_sdcard(0, card)
                    .and_then(|fatfs| {
                        MountedFatfs::mount(fatfs, SD_MOUNT_POINT, SD_MAX_OPEN_FILES)
                    })
                    .map_err(|err| {
                        warn!("sd card has no usable FAT volume: {err}");
                        MountError::Unsupported
                    })
            });

        let (mounted, failure) = match mounted {
            Ok(mounted) => (Some(mounted), None),
            Err(err) => (None, Some(err)),
        };
        Self {
            _mounted: mounted,
            failure,
            dir: DirVolume::new(SD_MOUNT_POINT),
        }
    }
}

impl<M> Volume for CardVolume<M> {
    type File = File;

    fn mount(&mut self) -> Result<(), MountError> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => self.dir.mount(),
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.dir.exists(path)
    }

    fn create(&mut self, path: &str) -> io::Result<File> {
        self.dir.create(path)
    }

    fn open_append(&mut self, path: &str) -> io::Result<File> {
        self.dir.open_append(path)
    }
}

type Panel<DI> = Ssd1306<DI, DisplaySize128x64, BufferedGraphicsMode<DisplaySize128x64>>;

/// 128x64 SSD1306: text rows on top, RSSI bottom left, climate bottom right.
struct OledPresenter<DI> {
    panel: Panel<DI>,
    /// Set once measurements are on screen; errors then overlay a single row
    /// instead of replacing the page.
    live: bool,
}

impl<DI: WriteOnlyDataCommand> OledPresenter<DI> {
    fn new(interface: DI) -> Self {
        let mut panel = Ssd1306::new(interface, DisplaySize128x64, DisplayRotation::Rotate180)
            .into_buffered_graphics_mode();
        if let Err(err) = panel.init() {
            warn!("display init failed: {err:?}");
        }
        Self { panel, live: false }
    }

    fn page(&mut self, text: &str) {
        self.live = false;
        self.panel.clear_buffer();
        for (row, line) in wrap_lines(text, PANEL_COLUMNS).iter().enumerate() {
            let at = Point::new(0, row as i32 * LINE_HEIGHT);
            self.draw(line, at, &FONT_6X10, Alignment::Left);
        }
        self.flush();
    }

    fn row(&mut self, y: i32, text: &str) {
        self.blank(Rectangle::new(
            Point::new(0, y),
            Size::new(PANEL_WIDTH as u32, LINE_HEIGHT as u32),
        ));
        if let Some(line) = wrap_lines(text, PANEL_COLUMNS).first() {
            self.draw(line, Point::new(0, y), &FONT_6X10, Alignment::Left);
        }
        self.flush();
    }

    fn blank(&mut self, area: Rectangle) {
        let _ = area
            .into_styled(PrimitiveStyle::with_fill(BinaryColor::Off))
            .draw(&mut self.panel);
    }

    fn draw(&mut self, text: &str, at: Point, font: &MonoFont<'_>, alignment: Alignment) {
        let character_style = MonoTextStyle::new(font, BinaryColor::On);
        let text_style = TextStyleBuilder::new()
            .baseline(Baseline::Top)
            .alignment(alignment)
            .build();
        let _ = Text::with_text_style(text, at, character_style, text_style).draw(&mut self.panel);
    }

    fn flush(&mut self) {
        if let Err(err) = self.panel.flush() {
            warn!("display flush failed: {err:?}");
        }
    }
}

impl<DI: WriteOnlyDataCommand> Presenter for OledPresenter<DI> {
    fn show_status(&mut self, text: &str) {
        self.page(text);
    }

    fn show_connecting(&mut self, ssid: &str) {
        self.page(&connecting_text(ssid));
    }

    fn show_connect_progress(&mut self, failed_polls: u32) {
        self.row(2 * LINE_HEIGHT, &progress_text(failed_polls));
    }

    fn show_connected(&mut self, ip: Ipv4Addr, channel: u8) {
        self.page(&format!("{MSG_CONNECTED}\n{}", link_text(ip, channel)));
    }

    fn show_signal(&mut self, rssi_dbm: i8) {
        self.live = true;
        self.blank(Rectangle::new(Point::new(0, 30), Size::new(80, 25)));
        self.draw(
            &signal_text(rssi_dbm),
            Point::new(0, 34),
            &FONT_10X20,
            Alignment::Left,
        );
        self.flush();
    }

    fn show_reading(&mut self, temperature_c: f64, relative_humidity_pct: f64) {
        self.live = true;
        self.blank(Rectangle::new(Point::new(81, 31), Size::new(47, 26)));
        self.draw(
            &temperature_text(temperature_c),
            Point::new(PANEL_WIDTH - 1, 32),
            &FONT_6X10,
            Alignment::Right,
        );
        self.draw(
            &humidity_text(relative_humidity_pct),
            Point::new(PANEL_WIDTH - 1, 32 + LINE_HEIGHT),
            &FONT_6X10,
            Alignment::Right,
        );
        self.flush();
    }

    fn show_error(&mut self, text: &str) {
        if self.live {
            self.row(2 * LINE_HEIGHT, text);
        } else {
            self.page(text);
        }
    }
}

#[derive(Debug, Serialize)]
struct UpdateAccepted {
    hostname: String,
    bytes: u64,
    sha256: String,
}

/// `POST /update` served by the IDF HTTP server. Started on the first `arm`
/// and kept for the life of the firmware; while disarmed it answers 503.
struct OtaUpdateListener {
    port: u16,
    tracker: UpdateTracker,
    server: Option<EspHttpServer<'static>>,
}

impl OtaUpdateListener {
    fn new(port: u16) -> Self {
        Self {
            port,
            tracker: UpdateTracker::new(),
            server: None,
        }
    }

    fn create_server(&self) -> anyhow::Result<EspHttpServer<'static>> {
        let conf = HttpConfiguration {
            http_port: self.port,
            stack_size: 16 * 1024,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&conf)?;

        let tracker = self.tracker.clone();
        server.fn_handler::<anyhow::Error, _>("/update", Method::Post, move |mut req| {
            let expected_token = match tracker.try_start() {
                Ok(token) => token,
                Err(err) => return write_error(req, &err),
            };
            let provided_token = req
                .header(TOKEN_HEADER)
                .unwrap_or_default()
                .trim()
                .to_string();
            let expected_sha256 = req
                .header(SHA256_HEADER)
                .map(|value| value.trim().to_string());

            let request = match UpdateRequest::authorize(
                &provided_token,
                &expected_token,
                expected_sha256.as_deref(),
            ) {
                Ok(request) => request,
                Err(err) => {
                    warn!("OTA update rejected: {err}");
                    tracker.fail(&err);
                    return write_error(req, &err);
                }
            };

            match receive_image(&mut req, &tracker, request) {
                Ok(summary) => {
                    tracker.complete(summary.bytes);
                    info!(
                        "OTA image written: {} bytes, sha256 {}",
                        summary.bytes, summary.sha256
                    );
                    write_json(
                        req,
                        &UpdateAccepted {
                            hostname: tracker.hostname(),
                            bytes: summary.bytes,
                            sha256: summary.sha256,
                        },
                    )
                }
                Err(err) => {
                    warn!("OTA update rejected: {err}");
                    tracker.fail(&err);
                    write_error(req, &err)
                }
            }
        })?;

        Ok(server)
    }
}

impl UpdateListener for OtaUpdateListener {
    fn arm(&mut self, hostname: &str, auth_token: &str) -> Result<(), UpdateError> {
        if self.server.is_none() {
            let server = self
                .create_server()
                .map_err(|err| UpdateError::Listener(format!("{err:#}")))?;
            info!("update listener on port {}", self.port);
            self.server = Some(server);
        }
        self.tracker.arm(hostname, auth_token);
        Ok(())
    }

    fn disarm(&mut self) {
        self.tracker.disarm();
    }

    fn service(&mut self) -> UpdatePoll {
        self.tracker.poll()
    }
}

struct OtaSink<'a> {
    update: EspOtaUpdate<'a>,
}

impl UpdateSink for OtaSink<'_> {
    fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateError> {
        self.update
            .write_all(chunk)
            .map_err(|err| UpdateError::Sink(format!("failed writing OTA data: {err:?}")))
    }

    fn commit(self) -> Result<(), UpdateError> {
        self.update
            .complete()
            .map(|_| ())
            .map_err(|err| UpdateError::Sink(format!("failed finalizing OTA image: {err:?}")))
    }

    fn abort(self) {
        if let Err(err) = self.update.abort() {
            warn!("failed to abort OTA update: {err:?}");
        }
    }
}

fn receive_image(
    req: &mut Request<&mut EspHttpConnection<'_>>,
    tracker: &UpdateTracker,
    request: UpdateRequest,
) -> Result<UpdateSummary, UpdateError> {
    let mut ota = EspOta::new()
        .map_err(|err| UpdateError::Sink(format!("failed to acquire OTA: {err:?}")))?;
    let update = ota
        .initiate_update()
        .map_err(|err| UpdateError::Sink(format!("failed to initiate OTA update: {err:?}")))?;
    let mut session = request.open(OtaSink { update });

    let mut chunk = [0_u8; OTA_CHUNK_SIZE];
    loop {
        let read = match req.read(&mut chunk) {
            Ok(read) => read,
            Err(err) => {
                session.abort();
                return Err(UpdateError::Sink(format!("request body read failed: {err:?}")));
            }
        };
        if read == 0 {
            break;
        }
        if let Err(err) = session.write(&chunk[..read]) {
            session.abort();
            return Err(err);
        }
        tracker.progress(session.bytes_written());
    }

    session.finish()
}

fn write_json<T: Serialize>(
    req: Request<&mut EspHttpConnection<'_>>,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: Request<&mut EspHttpConnection<'_>>, err: &UpdateError) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": err.to_string() });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        err.http_status(),
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn mark_running_slot_valid() {
    match EspOta::new() {
        Ok(mut ota) => {
            if let Err(err) = ota.mark_running_slot_valid() {
                warn!("failed to mark running OTA slot valid: {err:?}");
            }
        }
        Err(err) => warn!("failed to acquire OTA: {err:?}"),
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}
