// src/core/app/service.rs

//! Service Manager: allocates and reserves host ports for app containers,
//! retrying past conflicts rather than failing an install outright.

use std::ops::RangeInclusive;

use dashmap::DashMap;
use tracing::warn;

use crate::core::errors::PiccoloError;

const EPHEMERAL_RANGE: RangeInclusive<u16> = 20000..=40000;

/// Owner recorded against a port that conflicted with a live process outside
/// the reservation table (i.e. the container runtime refused to bind it).
/// Not tied to any app, so `release_all_for` never frees it.
const CONFLICT_SENTINEL: &str = "__reserved_conflict__";

pub struct ServiceManager {
    reservations: DashMap<u16, String>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self {
            reservations: DashMap::new(),
        }
    }

    /// Reserves `requested` for `app_name` if given, otherwise finds the
    /// first free port in the ephemeral range. Returns `PortInUse` if the
    /// requested port is already reserved by a different app.
    pub fn reserve(&self, app_name: &str, requested: Option<u16>) -> Result<u16, PiccoloError> {
        if let Some(port) = requested {
            match self.reservations.entry(port) {
                dashmap::mapref::entry::Entry::Occupied(existing) if existing.get() != app_name => {
                    return Err(PiccoloError::PortInUse(port));
                }
                dashmap::mapref::entry::Entry::Occupied(_) => return Ok(port),
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(app_name.to_string());
                    return Ok(port);
                }
            }
        }

        for port in EPHEMERAL_RANGE {
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.reservations.entry(port) {
                slot.insert(app_name.to_string());
                return Ok(port);
            }
        }
        Err(PiccoloError::Transient("no free ports in ephemeral range".to_string()))
    }

    /// Reserves one port per element of `requested`, retrying conflicting
    /// ports up to `attempts` times before giving up and releasing any ports
    /// already claimed during this call.
    pub fn reserve_with_retries(
        &self,
        app_name: &str,
        requested: &[Option<u16>],
        attempts: u32,
    ) -> Result<Vec<u16>, PiccoloError> {
        let mut last_err = None;
        for attempt in 0..attempts {
            let mut claimed = Vec::new();
            let mut failed = false;
            for port in requested {
                match self.reserve(app_name, *port) {
                    Ok(p) => claimed.push(p),
                    Err(e) => {
                        last_err = Some(e);
                        failed = true;
                        break;
                    }
                }
            }
            if !failed {
                return Ok(claimed);
            }
            for port in &claimed {
                self.release(*port);
            }
            warn!(app_name, attempt, "port reservation attempt failed, retrying");
        }
        Err(last_err.unwrap_or_else(|| PiccoloError::Transient("port reservation exhausted retries".to_string())))
    }

    /// Marks `port` as permanently reserved after the container runtime
    /// reports it as already bound, so the next allocation attempt for this
    /// app skips it instead of retrying the same conflict.
    pub fn reserve_offending(&self, port: u16) {
        self.reservations.insert(port, CONFLICT_SENTINEL.to_string());
    }

    pub fn release(&self, port: u16) {
        self.reservations.remove(&port);
    }

    pub fn release_all_for(&self, app_name: &str) {
        self.reservations.retain(|_, owner| owner != app_name);
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserving_the_same_requested_port_twice_for_different_apps_conflicts() {
        let svc = ServiceManager::new();
        svc.reserve("app-a", Some(8080)).unwrap();
        assert!(matches!(svc.reserve("app-b", Some(8080)), Err(PiccoloError::PortInUse(8080))));
    }

    #[test]
    fn reserve_without_request_picks_a_free_ephemeral_port() {
        let svc = ServiceManager::new();
        let port = svc.reserve("app-a", None).unwrap();
        assert!(EPHEMERAL_RANGE.contains(&port));
    }

    #[test]
    fn offending_port_stays_reserved_across_apps() {
        let svc = ServiceManager::new();
        svc.reserve_offending(20000);
        assert!(matches!(svc.reserve("app-a", Some(20000)), Err(PiccoloError::PortInUse(20000))));
        assert_ne!(svc.reserve("app-a", None).unwrap(), 20000);
    }

    #[test]
    fn retries_release_partially_claimed_ports_on_conflict() {
        let svc = ServiceManager::new();
        svc.reserve("app-a", Some(9000)).unwrap();
        let result = svc.reserve_with_retries("app-b", &[Some(8000), Some(9000)], 2);
        assert!(result.is_err());
        // app-b must not have leaked a reservation on 8000 after the retry failed.
        assert!(svc.reserve("app-c", Some(8000)).is_ok());
    }
}
