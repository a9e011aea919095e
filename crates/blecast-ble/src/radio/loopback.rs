//! In-memory radio medium
//!
//! [`LoopbackAir`] stands in for the space between devices. Every
//! [`LoopbackRadio`] created from it can advertise and scan; a scanning radio
//! receives a report for every advertisement currently on the air once per
//! report interval, so one fragment held for a full dwell is heard several
//! times, like a real scanner in range would. Reports can be dropped at a
//! configurable rate.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand_core::{OsRng, RngCore};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use blecast_core::{
    ChannelId, DeviceAddress, Result, ScanEvent, SystemTimeSource, TimeSource,
    DEFAULT_BLE_OVERHEAD, LEGACY_MAX_ADVERTISING_LENGTH,
};

use super::{AdapterState, Advertiser, ScanEventStream, Scanner};
use crate::error::BleError;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Properties of the simulated medium
#[derive(Debug, Clone, PartialEq)]
pub struct LoopbackConfig {
    /// Raw advertising limit each radio reports
    pub max_advertising_length: usize,
    /// Advertisement bytes taken by non-manufacturer structures
    pub ble_overhead: usize,
    /// How often a scanner hears each advertisement on the air
    pub report_interval: Duration,
    /// Probability in `[0, 1]` that a single report is lost
    pub loss_rate: f64,
    pub rssi: i16,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            max_advertising_length: LEGACY_MAX_ADVERTISING_LENGTH,
            ble_overhead: DEFAULT_BLE_OVERHEAD,
            report_interval: Duration::from_millis(100),
            loss_rate: 0.0,
            rssi: -50,
        }
    }
}

impl LoopbackConfig {
    pub fn with_max_advertising_length(mut self, length: usize) -> Self {
        self.max_advertising_length = length;
        self
    }

    pub fn with_ble_overhead(mut self, overhead: usize) -> Self {
        self.ble_overhead = overhead;
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn with_loss_rate(mut self, loss_rate: f64) -> Self {
        self.loss_rate = loss_rate.clamp(0.0, 1.0);
        self
    }
}

// ----------------------------------------------------------------------------
// Air
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct OnAir {
    address: DeviceAddress,
    channel: ChannelId,
    company_id: u16,
    data: Vec<u8>,
}

struct AirInner {
    config: LoopbackConfig,
    advertisements: Mutex<Vec<OnAir>>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    clock: Arc<dyn TimeSource>,
    next_device: AtomicU8,
}

/// Shared simulated medium
#[derive(Clone)]
pub struct LoopbackAir {
    inner: Arc<AirInner>,
}

impl LoopbackAir {
    pub fn new(config: LoopbackConfig) -> Self {
        Self::with_parts(config, Box::new(OsRng), Arc::new(SystemTimeSource))
    }

    /// Medium with a caller-supplied loss RNG and report clock
    pub fn with_parts(
        config: LoopbackConfig,
        rng: Box<dyn RngCore + Send>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            inner: Arc::new(AirInner {
                config,
                advertisements: Mutex::new(Vec::new()),
                rng: Mutex::new(rng),
                clock,
                next_device: AtomicU8::new(1),
            }),
        }
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.inner.config
    }

    /// Attach a new device to the medium
    pub fn radio(&self) -> LoopbackRadio {
        let n = self.inner.next_device.fetch_add(1, Ordering::Relaxed);
        LoopbackRadio::new(self.clone(), DeviceAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, n]))
    }

    /// Manufacturer data `address` currently advertises on `channel`
    pub async fn advertised(&self, address: DeviceAddress, channel: ChannelId) -> Option<Vec<u8>> {
        self.inner
            .advertisements
            .lock()
            .await
            .iter()
            .find(|ad| ad.address == address && ad.channel == channel)
            .map(|ad| ad.data.clone())
    }

    /// Number of advertisements on the air
    pub async fn active_advertisements(&self) -> usize {
        self.inner.advertisements.lock().await.len()
    }

    async fn put(&self, address: DeviceAddress, channel: ChannelId, company_id: u16, data: Vec<u8>) {
        let mut ads = self.inner.advertisements.lock().await;
        match ads
            .iter_mut()
            .find(|ad| ad.address == address && ad.channel == channel)
        {
            Some(ad) => {
                ad.company_id = company_id;
                ad.data = data;
            }
            None => ads.push(OnAir {
                address,
                channel,
                company_id,
                data,
            }),
        }
    }

    async fn remove(&self, address: DeviceAddress, channel: ChannelId) -> bool {
        let mut ads = self.inner.advertisements.lock().await;
        let before = ads.len();
        ads.retain(|ad| !(ad.address == address && ad.channel == channel));
        ads.len() != before
    }

    async fn is_lost(&self) -> bool {
        let loss_rate = self.inner.config.loss_rate;
        if loss_rate <= 0.0 {
            return false;
        }
        if loss_rate >= 1.0 {
            return true;
        }
        let roll = self.inner.rng.lock().await.next_u32() as f64 / u32::MAX as f64;
        roll < loss_rate
    }

    /// One round of reports as heard by `listener`
    async fn reports_for(&self, listener: DeviceAddress) -> Vec<ScanEvent> {
        let ads: Vec<OnAir> = self
            .inner
            .advertisements
            .lock()
            .await
            .iter()
            .filter(|ad| ad.address != listener)
            .cloned()
            .collect();

        let mut events = Vec::with_capacity(ads.len());
        for ad in ads {
            if self.is_lost().await {
                trace!("Loopback dropped report from {} on {}", ad.address, ad.channel);
                continue;
            }
            events.push(ScanEvent::new(
                ad.channel,
                ad.company_id,
                ad.data,
                ad.address,
                self.inner.config.rssi,
                self.inner.clock.now(),
            ));
        }
        events
    }
}

impl Default for LoopbackAir {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

// ----------------------------------------------------------------------------
// Radio
// ----------------------------------------------------------------------------

/// One simulated device attached to a [`LoopbackAir`]
#[derive(Clone)]
pub struct LoopbackRadio {
    air: LoopbackAir,
    address: DeviceAddress,
    state: Arc<Mutex<AdapterState>>,
    history: Arc<Mutex<Vec<Vec<u8>>>>,
    scan_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LoopbackRadio {
    fn new(air: LoopbackAir, address: DeviceAddress) -> Self {
        Self {
            air,
            address,
            state: Arc::new(Mutex::new(AdapterState::On)),
            history: Arc::new(Mutex::new(Vec::new())),
            scan_task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn air(&self) -> &LoopbackAir {
        &self.air
    }

    /// Simulate the user toggling Bluetooth or revoking permission
    pub async fn set_adapter_state(&self, state: AdapterState) {
        *self.state.lock().await = state;
    }

    /// Every payload this radio has put on the air, in order
    pub async fn history(&self) -> Vec<Vec<u8>> {
        self.history.lock().await.clone()
    }

    pub async fn is_scanning(&self) -> bool {
        self.scan_task.lock().await.is_some()
    }

    async fn transmit(&self, channel: ChannelId, company_id: u16, data: Vec<u8>) -> Result<()> {
        self.state.lock().await.ensure_available()?;

        let config = self.air.config();
        let max_size = config.max_advertising_length.saturating_sub(config.ble_overhead);
        if data.len() > max_size {
            return Err(BleError::AdvertisementTooLarge {
                size: data.len(),
                max_size,
            }
            .into());
        }

        self.history.lock().await.push(data.clone());
        self.air.put(self.address, channel, company_id, data).await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Advertiser for LoopbackRadio {
    async fn adapter_state(&self) -> AdapterState {
        *self.state.lock().await
    }

    async fn max_advertising_length(&self) -> Result<usize> {
        Ok(self.air.config().max_advertising_length)
    }

    async fn start_advertising(&self, channel: ChannelId, company_id: u16, data: Vec<u8>) -> Result<()> {
        debug!("Loopback {} advertising {} bytes on {}", self.address, data.len(), channel);
        self.transmit(channel, company_id, data).await
    }

    async fn update_advertising(&self, channel: ChannelId, company_id: u16, data: Vec<u8>) -> Result<()> {
        trace!("Loopback {} updating {} to {} bytes", self.address, channel, data.len());
        self.transmit(channel, company_id, data).await
    }

    async fn stop_advertising(&self, channel: ChannelId) -> Result<()> {
        if self.air.remove(self.address, channel).await {
            debug!("Loopback {} stopped advertising on {}", self.address, channel);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Scanner for LoopbackRadio {
    async fn adapter_state(&self) -> AdapterState {
        *self.state.lock().await
    }

    async fn start_scan(&self) -> Result<ScanEventStream> {
        self.state.lock().await.ensure_available()?;

        let mut task = self.scan_task.lock().await;
        if task.is_some() {
            return Err(BleError::AlreadyScanning.into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let air = self.air.clone();
        let listener = self.address;
        let period = air.config().report_interval;

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                for event in air.reports_for(listener).await {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
        }));
        debug!("Loopback {} scanning", self.address);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(handle) = self.scan_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
            debug!("Loopback {} stopped scanning", self.address);
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
