//! Real adapter backend
//!
//! Advertising goes through BlueZ via `bluer`; scanning uses `btleplug`
//! central mode. BlueZ has no in-place update of a registered advertisement,
//! so updating re-registers it with the new manufacturer data.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter as CentralFilter};
use btleplug::platform::{Adapter, Manager};
use futures::StreamExt;
use smallvec::SmallVec;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use blecast_core::{
    ChannelId, DeviceAddress, Result, ScanEvent, SystemTimeSource, TimeSource,
    LEGACY_MAX_ADVERTISING_LENGTH,
};

use super::{AdapterState, Advertiser, ScanEventStream, Scanner};
use crate::error::BleError;

// ----------------------------------------------------------------------------
// BlueZ Advertiser
// ----------------------------------------------------------------------------

pub struct BluezAdvertiser {
    session: Mutex<Option<(bluer::Session, bluer::Adapter)>>,
    handles: Mutex<HashMap<ChannelId, bluer::adv::AdvertisementHandle>>,
    max_advertising_length: usize,
}

impl BluezAdvertiser {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(None),
            handles: Mutex::new(HashMap::new()),
            max_advertising_length: LEGACY_MAX_ADVERTISING_LENGTH,
        }
    }

    /// Override the reported raw advertising limit, e.g. for extended advertising
    pub fn with_max_advertising_length(mut self, length: usize) -> Self {
        self.max_advertising_length = length;
        self
    }

    async fn adapter(&self) -> Result<bluer::Adapter> {
        let mut session = self.session.lock().await;
        if let Some((_, adapter)) = session.as_ref() {
            return Ok(adapter.clone());
        }

        let bluez = bluer::Session::new()
            .await
            .map_err(|e| BleError::AdapterNotAvailable(format!("BlueZ session: {}", e)))?;
        let adapter = bluez
            .default_adapter()
            .await
            .map_err(|e| BleError::AdapterNotAvailable(format!("BLE adapter: {}", e)))?;

        info!("BlueZ adapter {} initialized for advertising", adapter.name());
        *session = Some((bluez, adapter.clone()));
        Ok(adapter)
    }

    async fn register(&self, channel: ChannelId, company_id: u16, data: Vec<u8>) -> Result<()> {
        let adapter = self.adapter().await?;

        let mut manufacturer_data = BTreeMap::new();
        manufacturer_data.insert(company_id, data);
        let mut service_uuids = BTreeSet::new();
        service_uuids.insert(*channel.as_uuid());

        let advertisement = bluer::adv::Advertisement {
            advertisement_type: bluer::adv::Type::Broadcast,
            service_uuids,
            manufacturer_data,
            ..Default::default()
        };

        let handle = adapter
            .advertise(advertisement)
            .await
            .map_err(|e| BleError::AdvertiseFailed(e.to_string()))?;

        // Dropping the previous handle unregisters it
        self.handles.lock().await.insert(channel, handle);
        Ok(())
    }
}

impl Default for BluezAdvertiser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Advertiser for BluezAdvertiser {
    async fn adapter_state(&self) -> AdapterState {
        let adapter = match self.adapter().await {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!("BlueZ unavailable: {}", err);
                return AdapterState::Unsupported;
            }
        };
        match adapter.is_powered().await {
            Ok(true) => AdapterState::On,
            Ok(false) => AdapterState::Off,
            Err(err) => {
                warn!("Cannot read adapter power state: {}", err);
                AdapterState::Unauthorized
            }
        }
    }

    async fn max_advertising_length(&self) -> Result<usize> {
        Ok(self.max_advertising_length)
    }

    async fn start_advertising(&self, channel: ChannelId, company_id: u16, data: Vec<u8>) -> Result<()> {
        self.register(channel, company_id, data).await?;
        info!("Started BLE advertising on {}", channel);
        Ok(())
    }

    async fn update_advertising(&self, channel: ChannelId, company_id: u16, data: Vec<u8>) -> Result<()> {
        self.register(channel, company_id, data).await
    }

    async fn stop_advertising(&self, channel: ChannelId) -> Result<()> {
        if self.handles.lock().await.remove(&channel).is_some() {
            info!("Stopped BLE advertising on {}", channel);
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// btleplug Scanner
// ----------------------------------------------------------------------------

pub struct BtleplugScanner {
    adapter: Mutex<Option<Adapter>>,
}

impl BtleplugScanner {
    pub fn new() -> Self {
        Self {
            adapter: Mutex::new(None),
        }
    }

    async fn adapter(&self) -> Result<Adapter> {
        let mut slot = self.adapter.lock().await;
        if let Some(adapter) = slot.as_ref() {
            return Ok(adapter.clone());
        }

        let manager = Manager::new()
            .await
            .map_err(|e| BleError::AdapterNotAvailable(format!("BLE manager: {}", e)))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| BleError::AdapterNotAvailable(format!("BLE adapters: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::AdapterNotAvailable("No BLE adapters available".to_string()))?;

        info!("BLE adapter initialized for scanning");
        *slot = Some(adapter.clone());
        Ok(adapter)
    }
}

impl Default for BtleplugScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn a manufacturer data report into a scan event
async fn to_scan_event(
    adapter: &Adapter,
    event: CentralEvent,
    clock: &SystemTimeSource,
) -> Option<ScanEvent> {
    let CentralEvent::ManufacturerDataAdvertisement {
        id,
        manufacturer_data,
    } = event
    else {
        return None;
    };

    let peripheral = adapter.peripheral(&id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;

    Some(ScanEvent {
        advertised_channels: properties.services.iter().copied().collect::<SmallVec<_>>(),
        manufacturer_data,
        address: DeviceAddress::new(properties.address.into_inner()),
        rssi: properties.rssi.unwrap_or(i16::MIN),
        timestamp: clock.now(),
    })
}

#[async_trait::async_trait]
impl Scanner for BtleplugScanner {
    async fn adapter_state(&self) -> AdapterState {
        match self.adapter().await {
            Ok(_) => AdapterState::On,
            Err(err) => {
                debug!("Scanner adapter unavailable: {}", err);
                AdapterState::Unsupported
            }
        }
    }

    async fn start_scan(&self) -> Result<ScanEventStream> {
        let adapter = self.adapter().await?;
        let events = adapter
            .events()
            .await
            .map_err(|e| BleError::EventStreamFailed(e.to_string()))?;

        adapter
            .start_scan(CentralFilter::default())
            .await
            .map_err(|e| BleError::ScanFailed(format!("Failed to start BLE scan: {}", e)))?;
        info!("Started BLE scanning");

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move { to_scan_event(&adapter, event, &SystemTimeSource).await }
        });
        Ok(stream.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(adapter) = self.adapter.lock().await.as_ref() {
            adapter
                .stop_scan()
                .await
                .map_err(|e| BleError::ScanFailed(format!("Failed to stop BLE scan: {}", e)))?;
            info!("Stopped BLE scanning");
        }
        Ok(())
    }
}
