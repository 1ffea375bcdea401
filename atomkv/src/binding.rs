//! Reactive bindings
//!
//! A [`Binding`] ties an atom's listener to the lifetime of a consumer
//! (a mounted component, a task, a scope). Attaching registers the
//! listener; dropping or detaching the binding releases it synchronously,
//! and no callback reaches the consumer after that.
//!
//! ```ignore
//! let binding = Binding::attach(&atom, |value, status| render(value, status));
//! let (value, setter, status) = binding.current();
//! setter.set(json!(5)).await?;
//! drop(binding); // unmount
//! ```

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::atom::{Atom, Snapshot, Status, Subscription};
use crate::error::StoreError;

/// Writes to the atom a binding is attached to
#[derive(Clone, Debug)]
pub struct Setter {
    atom: Atom,
}

impl Setter {
    /// See [`Atom::set`]
    pub fn set(&self, value: Value) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
        self.atom.set(value)
    }

    /// See [`Atom::set_as`]
    pub fn set_as<T: Serialize>(
        &self,
        value: &T,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
        self.atom.set_as(value)
    }

    /// See [`Atom::remove`]
    pub fn remove(&self) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
        self.atom.remove()
    }
}

/// Listener attached to an atom for the lifetime of its consumer
#[must_use = "dropping a binding detaches it immediately"]
#[derive(Debug)]
pub struct Binding {
    subscription: Subscription,
}

impl Binding {
    /// Register `listener` with the atom
    pub fn attach<F>(atom: &Atom, listener: F) -> Self
    where
        F: Fn(&Value, Status) + Send + Sync + 'static,
    {
        Self {
            subscription: atom.subscribe(listener),
        }
    }

    /// Attach a binding that forwards every change into a channel
    pub fn channel(atom: &Atom) -> (Self, mpsc::UnboundedReceiver<Snapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let binding = Self::attach(atom, move |value, status| {
            // The receiver may be gone already; the binding is then just idle.
            let _ = tx.send(Snapshot {
                value: value.clone(),
                status,
            });
        });
        (binding, rx)
    }

    #[must_use]
    pub fn atom(&self) -> &Atom {
        self.subscription.atom()
    }

    /// Current value, a setter and the current status
    #[must_use]
    pub fn current(&self) -> (Value, Setter, Status) {
        let Snapshot { value, status } = self.atom().snapshot();
        (value, self.setter(), status)
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.atom().snapshot()
    }

    /// Decode the current value
    ///
    /// # Errors
    ///
    /// `SerializationFailure` if the value does not match `T`.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        self.atom().get_as()
    }

    #[must_use]
    pub fn setter(&self) -> Setter {
        Setter {
            atom: self.atom().clone(),
        }
    }

    /// Release the listener now. Same as dropping the binding.
    pub fn detach(self) {
        self.subscription.unsubscribe();
    }
}

/// Run `body` with a binding attached; the binding is released on every
/// exit path of `body`, unwinding included
pub fn scoped<F, R>(atom: &Atom, listener: F, body: impl FnOnce(&Binding) -> R) -> R
where
    F: Fn(&Value, Status) + Send + Sync + 'static,
{
    let binding = Binding::attach(atom, listener);
    body(&binding)
}
