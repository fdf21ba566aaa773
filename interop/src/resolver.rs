//! Queue resolution
//!
//! Turns an ordered list of capability requests into a device choice and a
//! minimal set of queue families:
//!
//! 1. Device selection is first fit: the first physical device whose
//!    families together cover the union of every requested capability.
//! 2. Each request goes to the first family (in enumeration order) that
//!    covers it and still exposes queues.
//! 3. Requests that land on the same family are merged: capabilities are
//!    OR-ed, counts take the maximum. One queue set serves them all.
//!
//! Planning is pure; [`resolve_queues`] then creates the device and fetches
//! queue 0 of every planned family.

use conduit_shared::{
    satisfies, PhysicalDeviceInfo, QueueCapabilities, QueueFamilyBinding, QueueRequest,
};
use tracing::{debug, info};

use crate::backend::{QueueCreateRequest, SecondaryApi, SecondaryDevice};
use crate::error::{InteropError, InteropResult};

/// A family chosen for one or more requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedFamily {
    pub capabilities: QueueCapabilities,
    pub family_index: u32,
    pub queue_count: u32,
}

/// Result of planning, before any device exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePlan {
    /// Index of the chosen device in the enumeration.
    pub physical_index: usize,

    /// Distinct families, ordered by the first request that used them.
    pub families: Vec<PlannedFamily>,

    /// For each input request, the index into `families` serving it.
    pub assignments: Vec<usize>,
}

impl QueuePlan {
    /// Queue-creation requests for the device: one per distinct family.
    pub fn create_requests(&self) -> Vec<QueueCreateRequest> {
        self.families
            .iter()
            .map(|f| QueueCreateRequest {
                family_index: f.family_index,
                queue_count: f.queue_count,
            })
            .collect()
    }
}

/// First device whose combined family capabilities cover `requested`.
pub fn select_physical_device(
    devices: &[PhysicalDeviceInfo],
    requested: QueueCapabilities,
) -> Option<usize> {
    devices
        .iter()
        .position(|device| satisfies(device.family_union(), requested))
}

/// Choose a device and plan its queue families for `requests`.
pub fn plan_queues(
    devices: &[PhysicalDeviceInfo],
    requests: &[QueueRequest],
) -> InteropResult<QueuePlan> {
    if requests.is_empty() {
        return Err(InteropError::NoQueueRequests);
    }
    if let Some(index) = requests.iter().position(|r| r.count == Some(0)) {
        return Err(InteropError::InvalidQueueCount { index });
    }

    let requested: QueueCapabilities = requests.iter().map(|r| r.capabilities).collect();
    let physical_index = select_physical_device(devices, requested)
        .ok_or(InteropError::NoSuitableDevice { requested })?;
    let device = &devices[physical_index];
    debug!(
        "Selected physical device {} ({}) for {}",
        physical_index, device.name, requested
    );

    let mut families: Vec<PlannedFamily> = Vec::new();
    let mut assignments = Vec::with_capacity(requests.len());

    for (index, request) in requests.iter().enumerate() {
        // A family with no queues is exhausted before anyone asks.
        let (family_index, family) = device
            .queue_families
            .iter()
            .enumerate()
            .find(|(_, family)| {
                family.queue_count > 0 && satisfies(family.capabilities, request.capabilities)
            })
            .ok_or(InteropError::NoSuitableFamily {
                index,
                requested: request.capabilities,
            })?;
        let family_index = family_index as u32;
        let count = request.count.unwrap_or(family.queue_count);

        match families.iter().position(|p| p.family_index == family_index) {
            Some(existing) => {
                let merged = &mut families[existing];
                merged.capabilities |= request.capabilities;
                merged.queue_count = merged.queue_count.max(count);
                assignments.push(existing);
            }
            None => {
                families.push(PlannedFamily {
                    capabilities: request.capabilities,
                    family_index,
                    queue_count: count,
                });
                assignments.push(families.len() - 1);
            }
        }
    }

    for planned in &families {
        let available = device.queue_families[planned.family_index as usize].queue_count;
        if planned.queue_count > available {
            return Err(InteropError::QueueCountExceeded {
                family: planned.family_index,
                requested: planned.queue_count,
                available,
            });
        }
    }

    Ok(QueuePlan {
        physical_index,
        families,
        assignments,
    })
}

/// Queue bindings for a created device, one per distinct family.
#[derive(Debug, Clone)]
pub struct ResolvedQueues<Q> {
    bindings: Vec<QueueFamilyBinding<Q>>,
    assignments: Vec<usize>,
}

impl<Q: Copy> ResolvedQueues<Q> {
    /// Fetch queue 0 of every planned family from `device`.
    pub fn acquire<D>(plan: &QueuePlan, device: &D) -> Self
    where
        D: SecondaryDevice<Queue = Q>,
    {
        let bindings = plan
            .families
            .iter()
            .map(|f| QueueFamilyBinding {
                capabilities: f.capabilities,
                family_index: f.family_index,
                queue_count: f.queue_count,
                queue: device.queue(f.family_index, 0),
            })
            .collect();
        Self {
            bindings,
            assignments: plan.assignments.clone(),
        }
    }

    /// The distinct, merged bindings.
    pub fn compacted(&self) -> &[QueueFamilyBinding<Q>] {
        &self.bindings
    }

    /// The (merged) binding serving input request `index`.
    pub fn for_request(&self, index: usize) -> Option<&QueueFamilyBinding<Q>> {
        self.assignments.get(index).map(|&i| &self.bindings[i])
    }

    /// One binding per input request, in input order.
    pub fn per_request(&self) -> Vec<QueueFamilyBinding<Q>> {
        self.assignments.iter().map(|&i| self.bindings[i]).collect()
    }

    /// First binding whose capabilities cover `capabilities`.
    pub fn find(&self, capabilities: QueueCapabilities) -> Option<&QueueFamilyBinding<Q>> {
        self.bindings
            .iter()
            .find(|b| satisfies(b.capabilities, capabilities))
    }
}

/// A secondary device together with its resolved queues.
pub struct ResolvedDevice<D: SecondaryDevice> {
    pub device: D,
    pub physical: PhysicalDeviceInfo,
    pub queues: ResolvedQueues<D::Queue>,
}

/// Plan queues against `api`'s physical devices, create the device and
/// acquire its queues.
///
/// `gate` runs on the chosen physical device before the device is created;
/// returning an error aborts without creating anything.
pub fn resolve_queues<A, G>(
    api: &A,
    requests: &[QueueRequest],
    gate: G,
) -> InteropResult<ResolvedDevice<A::Device>>
where
    A: SecondaryApi,
    G: FnOnce(&PhysicalDeviceInfo) -> InteropResult<()>,
{
    let devices = api.physical_devices()?;
    let plan = plan_queues(&devices, requests)?;
    let physical = devices[plan.physical_index].clone();
    gate(&physical)?;

    let device = api.create_device(plan.physical_index, &plan.create_requests())?;
    let queues = ResolvedQueues::acquire(&plan, &device);
    info!(
        "Created secondary device on {} with {} queue family(ies)",
        physical.name,
        plan.families.len()
    );
    for binding in queues.compacted() {
        debug!(
            "  family {}: {} x{}",
            binding.family_index, binding.capabilities, binding.queue_count
        );
    }

    Ok(ResolvedDevice {
        device,
        physical,
        queues,
    })
}
