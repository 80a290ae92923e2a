//! An in-memory VPSie used by unit tests across the crate.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{
    types::{CreateVmRequest, Datacenter, Offering, OsImage, Vm},
    VpsieApi, VpsieError,
};

/// Fake fleet. Machines created through it start `running` and get a
/// predictable address, unless a failure is queued for the offering.
#[derive(Default)]
pub struct FakeVpsie {
    pub vms: Mutex<HashMap<String, Vm>>,
    pub offerings: Mutex<Vec<Offering>>,
    pub datacenters: Mutex<Vec<Datacenter>>,
    pub images: Mutex<Vec<OsImage>>,
    /// Offerings whose create calls fail with a client error.
    pub failing_offerings: Mutex<Vec<String>>,
    pub create_calls: AtomicUsize,
    pub list_offering_calls: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeVpsie {
    pub fn with_offerings(offerings: Vec<Offering>) -> Self {
        let fake = FakeVpsie::default();
        *fake.offerings.lock() = offerings;
        fake
    }
}

#[async_trait]
impl VpsieApi for FakeVpsie {
    async fn list_vms(&self) -> Result<Vec<Vm>, VpsieError> {
        Ok(self.vms.lock().values().cloned().collect())
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> Result<Vm, VpsieError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_offerings
            .lock()
            .iter()
            .any(|o| o == &request.offering_id)
        {
            return Err(VpsieError::ClientError {
                status: 422,
                message: format!("offering {} unavailable", request.offering_id),
            });
        }
        let id = format!("vm-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let vm = Vm {
            id: id.clone(),
            hostname: request.hostname.clone(),
            status: "running".to_owned(),
            ip_address: Some(format!("10.0.0.{}", self.vms.lock().len() + 10)),
            offering_id: request.offering_id.clone(),
            datacenter_id: request.datacenter_id.clone(),
            cpu: 2,
            memory_mb: 4096,
            disk_gb: 80,
        };
        self.vms.lock().insert(id, vm.clone());
        Ok(vm)
    }

    async fn get_vm(&self, id: &str) -> Result<Vm, VpsieError> {
        self.vms
            .lock()
            .get(id)
            .cloned()
            .ok_or(VpsieError::NotFound)
    }

    async fn delete_vm(&self, id: &str) -> Result<(), VpsieError> {
        match self.vms.lock().remove(id) {
            Some(_) => Ok(()),
            None => Err(VpsieError::NotFound),
        }
    }

    async fn list_offerings(&self) -> Result<Vec<Offering>, VpsieError> {
        self.list_offering_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.offerings.lock().clone())
    }

    async fn list_datacenters(&self) -> Result<Vec<Datacenter>, VpsieError> {
        Ok(self.datacenters.lock().clone())
    }

    async fn list_images(&self) -> Result<Vec<OsImage>, VpsieError> {
        Ok(self.images.lock().clone())
    }
}
