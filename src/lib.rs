//! Host-side UHS-II protocol engine for SD host controllers.
//!
//! Drives the UHS-II extension of the SDHCI register block: packet
//! assembly, link bring-up and dormant transitions, capability
//! negotiation, the command/request engine and the error-interrupt
//! classifier. The crate talks to hardware through the [`RegisterBus`]
//! trait, so it runs against memory-mapped controllers and test
//! doubles alike.
//!
//! A typical bring-up:
//!
//! ```ignore
//! let mut ctrl = Uhs2Controller::new(bus);
//! ctrl.attach()?;
//! let ident = ctrl.ident();
//! ```

#![cfg_attr(not(test), no_std)]

pub mod attach;
pub mod caps;
pub mod engine;
pub mod error;
pub mod io;
pub mod irq;
pub mod link;
pub mod packet;
pub mod regs;
pub mod wire;

#[cfg(test)]
mod mock;

pub use attach::CardIdent;
pub use caps::{CardConfig, HostCapabilities};
pub use engine::{CmdFlags, Command, CompletedRequest, DataTransfer, Quirks, Uhs2Controller};
pub use error::{Result, Uhs2Error};
pub use io::RegisterBus;
pub use packet::Uhs2Packet;

/// Lock-wrapped controller for use from multiple contexts.
///
/// The engine itself is `&mut self` throughout; this wrapper adds the
/// spinlock needed when the interrupt path and the request path can
/// race.
pub struct Uhs2Host<B: RegisterBus> {
    inner: spin::Mutex<Uhs2Controller<B>>,
}

impl<B: RegisterBus> Uhs2Host<B> {
    pub fn new(bus: B) -> Self {
        Uhs2Host {
            inner: spin::Mutex::new(Uhs2Controller::new(bus)),
        }
    }

    /// Attach the device behind the controller.
    pub fn attach(&self) -> Result<()> {
        self.inner.lock().attach()
    }

    /// Power down and forget the attached device.
    pub fn detach(&self) {
        self.inner.lock().detach()
    }

    /// Interrupt-context entry point; see [`Uhs2Controller::handle_irq`].
    pub fn handle_irq(&self, intmask: u32) -> u32 {
        self.inner.lock().handle_irq(intmask, None)
    }

    /// Run `f` with the controller locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut Uhs2Controller<B>) -> R) -> R {
        f(&mut self.inner.lock())
    }
}
