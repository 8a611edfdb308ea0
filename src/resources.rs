//! Resource manager: advisory exclusive locks on shared peripherals.
//!
//! One pool per [`ResourceType`], each guarded by its own mutex so that
//! GPIO traffic never contends with I²C traffic.
//!
//! ```text
//!  pool[I2cPort]   bitmap 0b…0101        owners ["", …, "oled", "", "bme280"]
//!                          ││└ id 0 ── "bme280"
//!                          │└─ id 1 ── free
//!                          └── id 2 ── "oled"
//! ```
//!
//! Locks are advisory: a module that never calls `lock` is not stopped
//! from touching the peripheral.  Re-locking by the current owner is a
//! no-op success; releasing a free resource is too.

use core::fmt;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::module::{ModuleName, module_name};

/// Ids per resource type (bitmap width).
pub const MAX_RESOURCE_ID: u8 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResourceType {
    Gpio = 0,
    I2cPort = 1,
    SpiHost = 2,
    Uart = 3,
    Timer = 4,
    Adc = 5,
    Pwm = 6,
    Rmt = 7,
}

impl ResourceType {
    pub const COUNT: usize = 8;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Gpio,
        Self::I2cPort,
        Self::SpiHost,
        Self::Uart,
        Self::Timer,
        Self::Adc,
        Self::Pwm,
        Self::Rmt,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Gpio => "gpio",
            Self::I2cPort => "i2c",
            Self::SpiHost => "spi",
            Self::Uart => "uart",
            Self::Timer => "timer",
            Self::Adc => "adc",
            Self::Pwm => "pwm",
            Self::Rmt => "rmt",
        }
    }
}

/// `(type, id)` pair used in errors and listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub ty: ResourceType,
    pub id: u8,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.ty.name(), self.id)
    }
}

struct Pool {
    bitmap: u64,
    owners: [Option<ModuleName>; MAX_RESOURCE_ID as usize],
}

impl Pool {
    fn new() -> Self {
        Self {
            bitmap: 0,
            owners: core::array::from_fn(|_| None),
        }
    }

    fn owner(&self, id: u8) -> Option<&str> {
        if self.bitmap & (1 << id) == 0 {
            None
        } else {
            self.owners[id as usize].as_deref()
        }
    }
}

pub struct ResourceManager {
    pools: [Mutex<Pool>; ResourceType::COUNT],
}

fn check_id(id: u8) -> Result<()> {
    if id < MAX_RESOURCE_ID {
        Ok(())
    } else {
        Err(Error::InvalidArgument("resource id must be below 64"))
    }
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            pools: core::array::from_fn(|_| Mutex::new(Pool::new())),
        }
    }

    fn pool(&self, ty: ResourceType) -> &Mutex<Pool> {
        &self.pools[ty as usize]
    }

    /// Take exclusive ownership of `(ty, id)` for `owner`.  Locking
    /// something `owner` already holds is a no-op.
    pub fn lock(&self, ty: ResourceType, id: u8, owner: &str) -> Result<()> {
        self.acquire(ty, id, owner, true)
    }

    fn acquire(&self, ty: ResourceType, id: u8, owner: &str, reentrant: bool) -> Result<()> {
        check_id(id)?;
        let name = module_name(owner)?;
        let key = ResourceKey { ty, id };
        let mut pool = self.pool(ty).lock();
        match pool.owner(id) {
            Some(current) if reentrant && current == owner => Ok(()),
            Some(current) => {
                warn!("ResourceManager: {} busy ('{}' wanted, '{}' holds)", key, owner, current);
                Err(Error::AlreadyLocked {
                    resource: key.to_string(),
                    owner: current.to_owned(),
                })
            }
            None => {
                pool.bitmap |= 1 << id;
                pool.owners[id as usize] = Some(name);
                debug!("ResourceManager: {} locked by '{}'", key, owner);
                Ok(())
            }
        }
    }

    /// Give up `(ty, id)`.  Fails only if someone else holds it.
    pub fn release(&self, ty: ResourceType, id: u8, owner: &str) -> Result<()> {
        check_id(id)?;
        let key = ResourceKey { ty, id };
        let mut pool = self.pool(ty).lock();
        match pool.owner(id) {
            None => Ok(()),
            Some(current) if current != owner => Err(Error::NotOwner {
                resource: key.to_string(),
                owner: current.to_owned(),
            }),
            Some(_) => {
                pool.bitmap &= !(1 << id);
                pool.owners[id as usize] = None;
                debug!("ResourceManager: {} released by '{}'", key, owner);
                Ok(())
            }
        }
    }

    /// Invalid ids report as locked so callers never use them.
    pub fn is_locked(&self, ty: ResourceType, id: u8) -> bool {
        if check_id(id).is_err() {
            return true;
        }
        self.pool(ty).lock().bitmap & (1 << id) != 0
    }

    pub fn owner(&self, ty: ResourceType, id: u8) -> Option<String> {
        check_id(id).ok()?;
        self.pool(ty).lock().owner(id).map(str::to_owned)
    }

    /// Every resource currently held by `owner`.
    pub fn locks_held_by(&self, owner: &str) -> Vec<ResourceKey> {
        let mut out = Vec::new();
        for ty in ResourceType::ALL {
            let pool = self.pool(ty).lock();
            for id in 0..MAX_RESOURCE_ID {
                if pool.owner(id) == Some(owner) {
                    out.push(ResourceKey { ty, id });
                }
            }
        }
        out
    }

    /// Forcibly release everything `owner` holds.  Returns how many.
    pub fn release_all(&self, owner: &str) -> usize {
        let mut released = 0;
        for ty in ResourceType::ALL {
            let mut pool = self.pool(ty).lock();
            for id in 0..MAX_RESOURCE_ID {
                if pool.owner(id) == Some(owner) {
                    pool.bitmap &= !(1 << id);
                    pool.owners[id as usize] = None;
                    released += 1;
                }
            }
        }
        if released > 0 {
            warn!("ResourceManager: force-released {} lock(s) of '{}'", released, owner);
        }
        released
    }

    /// Lock `(ty, id)` and return a guard that releases it on drop.
    ///
    /// Unlike `lock`, a lease is never reentrant: if `owner` already holds
    /// the resource the call fails with `AlreadyLocked`, so dropping a
    /// nested lease can never free a lock taken by an outer holder.
    pub fn lease(self: &Arc<Self>, ty: ResourceType, id: u8, owner: &str) -> Result<ResourceLease> {
        self.acquire(ty, id, owner, false)?;
        Ok(ResourceLease {
            manager: Arc::clone(self),
            key: ResourceKey { ty, id },
            owner: owner.to_owned(),
        })
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII lock on one resource.
#[must_use = "the resource is released as soon as the lease is dropped"]
pub struct ResourceLease {
    manager: Arc<ResourceManager>,
    key: ResourceKey,
    owner: String,
}

impl ResourceLease {
    pub fn key(&self) -> ResourceKey {
        self.key
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release(self.key.ty, self.key.id, &self.owner) {
            warn!("ResourceManager: lease on {} not released: {}", self.key, e);
        }
    }
}
