//! In-memory tunnel driver and network configurator.
//!
//! Behaves like the real driver at the contract level: adapters get unique
//! handles, configurations are stored whole and read back with the
//! two-phase size protocol, and failures can be injected per call.

use crate::driver::{
    AdapterHandle, AdapterLuid, AdapterState, ERROR_INVALID_HANDLE, GetConfigError, NativeCode,
    NetConfigurator, TunnelDriver,
};
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Version reported by a loaded fake driver.
pub const FAKE_DRIVER_VERSION: u32 = 0x0001_0000;

/// Driver error returned for injected create failures by default.
const ERROR_GEN_FAILURE: NativeCode = 31;

#[derive(Debug)]
struct FakeAdapter {
    name: String,
    tunnel_type: String,
    luid: AdapterLuid,
    config: Vec<u8>,
    state: AdapterState,
}

#[derive(Debug, Default)]
struct TunnelState {
    next_handle: u64,
    adapters: HashMap<AdapterHandle, FakeAdapter>,
    closed: Vec<AdapterHandle>,
    applies: usize,
    fail_next_apply: Option<NativeCode>,
    fail_next_create: Option<NativeCode>,
    fail_next_state: Option<NativeCode>,
}

/// Tunnel driver backed by a `HashMap` of adapters.
#[derive(Debug)]
pub struct MemoryTunnelDriver {
    version: u32,
    state: Mutex<TunnelState>,
}

impl Default for MemoryTunnelDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTunnelDriver {
    pub fn new() -> Self {
        Self::with_version(FAKE_DRIVER_VERSION)
    }

    /// A driver that reports version 0, i.e. not loaded.
    pub fn unavailable() -> Self {
        Self::with_version(0)
    }

    pub fn with_version(version: u32) -> Self {
        Self {
            version,
            state: Mutex::new(TunnelState {
                next_handle: 1,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TunnelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `set_configuration` fail with `code`.
    pub fn fail_next_apply(&self, code: NativeCode) {
        self.lock().fail_next_apply = Some(code);
    }

    /// Make the next `create_adapter` fail.
    pub fn fail_next_create(&self) {
        self.lock().fail_next_create = Some(ERROR_GEN_FAILURE);
    }

    /// Make the next `set_adapter_state` fail with `code`.
    pub fn fail_next_state(&self, code: NativeCode) {
        self.lock().fail_next_state = Some(code);
    }

    /// Last configuration accepted for `handle`.
    pub fn configuration(&self, handle: AdapterHandle) -> Option<Vec<u8>> {
        self.lock().adapters.get(&handle).map(|a| a.config.clone())
    }

    pub fn is_open(&self, handle: AdapterHandle) -> bool {
        self.lock().adapters.contains_key(&handle)
    }

    /// How many times `handle` was closed. Anything above 1 is a double release.
    pub fn close_count(&self, handle: AdapterHandle) -> usize {
        self.lock().closed.iter().filter(|h| **h == handle).count()
    }

    pub fn open_adapters(&self) -> usize {
        self.lock().adapters.len()
    }

    /// Handle of the open adapter called `name`.
    pub fn handle_by_name(&self, name: &str) -> Option<AdapterHandle> {
        self.lock()
            .adapters
            .iter()
            .find(|(_, a)| a.name == name)
            .map(|(h, _)| *h)
    }

    pub fn tunnel_type(&self, handle: AdapterHandle) -> Option<String> {
        self.lock().adapters.get(&handle).map(|a| a.tunnel_type.clone())
    }

    pub fn adapter_state(&self, handle: AdapterHandle) -> Option<AdapterState> {
        self.lock().adapters.get(&handle).map(|a| a.state)
    }

    /// Number of accepted `set_configuration` calls.
    pub fn apply_count(&self) -> usize {
        self.lock().applies
    }
}

impl TunnelDriver for MemoryTunnelDriver {
    fn running_version(&self) -> u32 {
        self.version
    }

    fn create_adapter(&self, name: &str, tunnel_type: &str) -> Result<AdapterHandle, NativeCode> {
        let mut state = self.lock();
        if let Some(code) = state.fail_next_create.take() {
            return Err(code);
        }
        let handle = AdapterHandle(state.next_handle);
        state.next_handle += 1;
        state.adapters.insert(
            handle,
            FakeAdapter {
                name: name.to_string(),
                tunnel_type: tunnel_type.to_string(),
                luid: AdapterLuid(0x1000 + handle.0),
                config: Vec::new(),
                state: AdapterState::Down,
            },
        );
        Ok(handle)
    }

    fn close_adapter(&self, handle: AdapterHandle) {
        let mut state = self.lock();
        state.adapters.remove(&handle);
        state.closed.push(handle);
    }

    fn adapter_luid(&self, handle: AdapterHandle) -> AdapterLuid {
        self.lock()
            .adapters
            .get(&handle)
            .map(|a| a.luid)
            .unwrap_or_default()
    }

    fn set_configuration(&self, handle: AdapterHandle, config: &[u8]) -> Result<(), NativeCode> {
        let mut state = self.lock();
        if let Some(code) = state.fail_next_apply.take() {
            return Err(code);
        }
        let adapter = state
            .adapters
            .get_mut(&handle)
            .ok_or(ERROR_INVALID_HANDLE)?;
        adapter.config = config.to_vec();
        state.applies += 1;
        Ok(())
    }

    fn get_configuration(
        &self,
        handle: AdapterHandle,
        buf: &mut [u8],
    ) -> Result<usize, GetConfigError> {
        let state = self.lock();
        let adapter = state
            .adapters
            .get(&handle)
            .ok_or(GetConfigError::Failed(ERROR_INVALID_HANDLE))?;
        let len = adapter.config.len();
        if buf.len() < len {
            return Err(GetConfigError::MoreData { needed: len });
        }
        buf[..len].copy_from_slice(&adapter.config);
        Ok(len)
    }

    fn set_adapter_state(
        &self,
        handle: AdapterHandle,
        new_state: AdapterState,
    ) -> Result<(), NativeCode> {
        let mut state = self.lock();
        if let Some(code) = state.fail_next_state.take() {
            return Err(code);
        }
        let adapter = state
            .adapters
            .get_mut(&handle)
            .ok_or(ERROR_INVALID_HANDLE)?;
        adapter.state = new_state;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct NetState {
    addresses: Vec<(AdapterLuid, Ipv4Addr, u8)>,
    routes: Vec<(AdapterLuid, Ipv4Net)>,
    fail_next: bool,
}

/// Records address and route assignments instead of touching the OS.
#[derive(Debug, Default)]
pub struct MemoryNetConfigurator {
    state: Mutex<NetState>,
}

impl MemoryNetConfigurator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `add_address` fail.
    pub fn fail_next(&self) {
        self.lock().fail_next = true;
    }

    pub fn addresses(&self) -> Vec<(AdapterLuid, Ipv4Addr, u8)> {
        self.lock().addresses.clone()
    }

    pub fn routes(&self) -> Vec<(AdapterLuid, Ipv4Net)> {
        self.lock().routes.clone()
    }
}

impl NetConfigurator for MemoryNetConfigurator {
    fn add_address(&self, luid: AdapterLuid, addr: Ipv4Addr, prefix_len: u8) -> io::Result<()> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "address assignment refused",
            ));
        }
        state.addresses.push((luid, addr, prefix_len));
        Ok(())
    }

    fn add_route(&self, luid: AdapterLuid, destination: Ipv4Net) -> io::Result<()> {
        let mut state = self.lock();
        // Same route twice is fine
        if !state.routes.contains(&(luid, destination)) {
            state.routes.push((luid, destination));
        }
        Ok(())
    }
}
