//! Radio interface abstraction.
//!
//! Concrete drivers (ESP-NOW, LoRa UART, test fixtures) are injected as
//! callbacks. Each operation comes in exactly one flavor — synchronous or
//! suspending — validated at construction. The interface itself only moves
//! datagrams between its three bounded queues and the driver; all protocol
//! logic lives in the Packager.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;

use mycel_core::ident::{interface_id, InterfaceId};
use mycel_core::schema::{all_schema_ids, get_schema, Schema};

/// Capacity of the inbox, outbox, and castbox.
pub const BOX_CAP: usize = 256;

/// Capacity of the loopback interface's line buffer.
pub const LOOPBACK_LINE_BUFFER: usize = 10;

pub type DriverFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A raw frame plus where it came from / where it should go.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Bytes,
    pub intrfc_id: Option<InterfaceId>,
    /// Link-level address (MAC) of the sender or destination.
    pub addr: Option<Bytes>,
}

impl Datagram {
    pub fn new(data: Bytes, intrfc_id: InterfaceId, addr: Option<Bytes>) -> Self {
        Datagram { data, intrfc_id: Some(intrfc_id), addr }
    }
}

/// Receive driver: polled until it returns None.
pub enum RecvDriver {
    Sync(Box<dyn FnMut() -> Option<Datagram> + Send>),
    Async(Box<dyn FnMut() -> DriverFuture<Option<Datagram>> + Send>),
}

/// Send / broadcast driver: consumes one datagram per call.
pub enum TxDriver {
    Sync(Box<dyn FnMut(Datagram) + Send>),
    Async(Box<dyn FnMut(Datagram) -> DriverFuture<()> + Send>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterfaceError {
    #[error("interface `{0}` is missing its {1} driver")]
    MissingDriver(String, &'static str),

    #[error("interface `{0}` supports no schemas")]
    NoSchemas(String),

    #[error("interface `{0}` lists unknown schema id {1}")]
    UnknownSchema(String, u8),
}

/// One attached radio (or loopback), with bounded queues on both sides.
pub struct Interface {
    pub name: String,
    pub bitrate: u32,
    pub supported_schemas: Vec<u8>,
    pub id: InterfaceId,
    inbox: VecDeque<Datagram>,
    outbox: VecDeque<Datagram>,
    castbox: VecDeque<Datagram>,
    recv: RecvDriver,
    send: TxDriver,
    cast: TxDriver,
    wake: Option<Box<dyn FnMut() + Send>>,
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("bitrate", &self.bitrate)
            .field("id", &hex::encode(self.id))
            .field("inbox", &self.inbox.len())
            .field("outbox", &self.outbox.len())
            .field("castbox", &self.castbox.len())
            .finish()
    }
}

fn push_rolling(queue: &mut VecDeque<Datagram>, cap: usize, d: Datagram) {
    if queue.len() >= cap {
        queue.pop_front();
    }
    queue.push_back(d);
}

impl Interface {
    /// The schema used for control packets: `supported_schemas[0]`.
    pub fn default_schema(&self) -> &'static Schema {
        get_schema(self.supported_schemas[0]).expect("validated at build")
    }

    /// Pop one received datagram, if any.
    pub fn receive(&mut self) -> Option<Datagram> {
        self.inbox.pop_front()
    }

    /// Queue a datagram for unicast transmission.
    pub fn send(&mut self, datagram: Datagram) {
        push_rolling(&mut self.outbox, BOX_CAP, datagram);
    }

    /// Queue a datagram for broadcast transmission.
    pub fn broadcast(&mut self, datagram: Datagram) {
        push_rolling(&mut self.castbox, BOX_CAP, datagram);
    }

    /// Wake the radio after a modem-sleep cycle.
    pub fn wake(&mut self) {
        if let Some(wake) = &mut self.wake {
            wake();
        }
    }

    /// Drain the driver's received frames into the inbox, then flush at
    /// most one outbox item and at most one castbox item.
    pub async fn process(&mut self) {
        loop {
            let datagram = match &mut self.recv {
                RecvDriver::Sync(f) => f(),
                RecvDriver::Async(f) => f().await,
            };
            match datagram {
                Some(d) => push_rolling(&mut self.inbox, BOX_CAP, d),
                None => break,
            }
        }

        if let Some(d) = self.outbox.pop_front() {
            match &mut self.send {
                TxDriver::Sync(f) => f(d),
                TxDriver::Async(f) => f(d).await,
            }
        }

        if let Some(d) = self.castbox.pop_front() {
            match &mut self.cast {
                TxDriver::Sync(f) => f(d),
                TxDriver::Async(f) => f(d).await,
            }
        }
    }

    #[cfg(test)]
    fn inbox_len(&self) -> usize {
        self.inbox.len()
    }

    /// In-process loopback used for inter-application delivery. Whatever is
    /// sent or broadcast comes back on the next `process()` tick.
    pub fn loopback() -> Interface {
        let line = Arc::new(Mutex::new(VecDeque::<Datagram>::new()));
        let recv_line = line.clone();
        let send_line = line.clone();
        let cast_line = line;

        InterfaceBuilder::new("interapp", 1_000_000_000, all_schema_ids())
            .recv_sync(move || recv_line.lock().unwrap().pop_front())
            .send_sync(move |d| {
                let mut q = send_line.lock().unwrap();
                if q.len() >= LOOPBACK_LINE_BUFFER {
                    q.pop_front();
                }
                q.push_back(d);
            })
            .broadcast_sync(move |d| {
                let mut q = cast_line.lock().unwrap();
                if q.len() >= LOOPBACK_LINE_BUFFER {
                    q.pop_front();
                }
                q.push_back(d);
            })
            .build()
            .expect("loopback drivers are always present")
    }
}

/// Builder that enforces the driver contract: one flavor per operation.
pub struct InterfaceBuilder {
    name: String,
    bitrate: u32,
    supported_schemas: Vec<u8>,
    recv: Option<RecvDriver>,
    send: Option<TxDriver>,
    cast: Option<TxDriver>,
    wake: Option<Box<dyn FnMut() + Send>>,
}

impl InterfaceBuilder {
    pub fn new(name: impl Into<String>, bitrate: u32, supported_schemas: Vec<u8>) -> Self {
        InterfaceBuilder {
            name: name.into(),
            bitrate,
            supported_schemas,
            recv: None,
            send: None,
            cast: None,
            wake: None,
        }
    }

    pub fn recv_sync(mut self, f: impl FnMut() -> Option<Datagram> + Send + 'static) -> Self {
        self.recv = Some(RecvDriver::Sync(Box::new(f)));
        self
    }

    pub fn recv_async(
        mut self,
        f: impl FnMut() -> DriverFuture<Option<Datagram>> + Send + 'static,
    ) -> Self {
        self.recv = Some(RecvDriver::Async(Box::new(f)));
        self
    }

    pub fn send_sync(mut self, f: impl FnMut(Datagram) + Send + 'static) -> Self {
        self.send = Some(TxDriver::Sync(Box::new(f)));
        self
    }

    pub fn send_async(
        mut self,
        f: impl FnMut(Datagram) -> DriverFuture<()> + Send + 'static,
    ) -> Self {
        self.send = Some(TxDriver::Async(Box::new(f)));
        self
    }

    pub fn broadcast_sync(mut self, f: impl FnMut(Datagram) + Send + 'static) -> Self {
        self.cast = Some(TxDriver::Sync(Box::new(f)));
        self
    }

    pub fn broadcast_async(
        mut self,
        f: impl FnMut(Datagram) -> DriverFuture<()> + Send + 'static,
    ) -> Self {
        self.cast = Some(TxDriver::Async(Box::new(f)));
        self
    }

    pub fn wake(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.wake = Some(Box::new(f));
        self
    }

    /// Validate the driver set and schema list, derive the interface id.
    pub fn build(self) -> Result<Interface, InterfaceError> {
        if self.supported_schemas.is_empty() {
            return Err(InterfaceError::NoSchemas(self.name));
        }
        for id in &self.supported_schemas {
            if get_schema(*id).is_err() {
                return Err(InterfaceError::UnknownSchema(self.name, *id));
            }
        }
        let recv = self
            .recv
            .ok_or_else(|| InterfaceError::MissingDriver(self.name.clone(), "receive"))?;
        let send = self
            .send
            .ok_or_else(|| InterfaceError::MissingDriver(self.name.clone(), "send"))?;
        let cast = self
            .cast
            .ok_or_else(|| InterfaceError::MissingDriver(self.name.clone(), "broadcast"))?;

        let id = interface_id(&self.name, self.bitrate, &self.supported_schemas);
        Ok(Interface {
            name: self.name,
            bitrate: self.bitrate,
            supported_schemas: self.supported_schemas,
            id,
            inbox: VecDeque::new(),
            outbox: VecDeque::new(),
            castbox: VecDeque::new(),
            recv,
            send,
            cast,
            wake: self.wake,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn null_builder(name: &str) -> InterfaceBuilder {
        InterfaceBuilder::new(name, 1000, vec![0, 1, 2])
            .recv_sync(|| None)
            .send_sync(|_| {})
            .broadcast_sync(|_| {})
    }

    #[test]
    fn build_requires_every_driver() {
        let err = InterfaceBuilder::new("radio", 1000, vec![0])
            .send_sync(|_| {})
            .broadcast_sync(|_| {})
            .build()
            .unwrap_err();
        assert_eq!(err, InterfaceError::MissingDriver("radio".into(), "receive"));

        let err = InterfaceBuilder::new("radio", 1000, vec![0])
            .recv_sync(|| None)
            .broadcast_sync(|_| {})
            .build()
            .unwrap_err();
        assert_eq!(err, InterfaceError::MissingDriver("radio".into(), "send"));
    }

    #[test]
    fn build_rejects_bad_schema_lists() {
        let err = InterfaceBuilder::new("radio", 1000, vec![])
            .recv_sync(|| None)
            .send_sync(|_| {})
            .broadcast_sync(|_| {})
            .build()
            .unwrap_err();
        assert_eq!(err, InterfaceError::NoSchemas("radio".into()));

        let err = InterfaceBuilder::new("radio", 1000, vec![0, 99])
            .recv_sync(|| None)
            .send_sync(|_| {})
            .broadcast_sync(|_| {})
            .build()
            .unwrap_err();
        assert_eq!(err, InterfaceError::UnknownSchema("radio".into(), 99));
    }

    #[test]
    fn id_is_stable_and_input_sensitive() {
        let a = null_builder("radio").build().unwrap();
        let b = null_builder("radio").build().unwrap();
        assert_eq!(a.id, b.id);

        let c = InterfaceBuilder::new("radio", 2000, vec![0, 1, 2])
            .recv_sync(|| None)
            .send_sync(|_| {})
            .broadcast_sync(|_| {})
            .build()
            .unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn default_schema_is_first_listed() {
        let i = InterfaceBuilder::new("radio", 1000, vec![2, 0])
            .recv_sync(|| None)
            .send_sync(|_| {})
            .broadcast_sync(|_| {})
            .build()
            .unwrap();
        assert_eq!(i.default_schema().id, 2);
    }

    #[tokio::test]
    async fn process_drains_receive_and_flushes_one_each() {
        let received = Arc::new(Mutex::new(vec![
            Datagram { data: Bytes::from_static(b"b"), intrfc_id: None, addr: None },
            Datagram { data: Bytes::from_static(b"a"), intrfc_id: None, addr: None },
        ]));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let cast = Arc::new(Mutex::new(Vec::new()));

        let r = received.clone();
        let s = sent.clone();
        let c = cast.clone();
        let mut i = InterfaceBuilder::new("radio", 1000, vec![0])
            .recv_sync(move || r.lock().unwrap().pop())
            .send_sync(move |d| s.lock().unwrap().push(d))
            .broadcast_sync(move |d| c.lock().unwrap().push(d))
            .build()
            .unwrap();

        let id = i.id;
        i.send(Datagram::new(Bytes::from_static(b"s1"), id, None));
        i.send(Datagram::new(Bytes::from_static(b"s2"), id, None));
        i.broadcast(Datagram::new(Bytes::from_static(b"c1"), id, None));

        i.process().await;
        assert_eq!(i.inbox_len(), 2); // both frames drained
        assert_eq!(sent.lock().unwrap().len(), 1); // one unicast flushed
        assert_eq!(cast.lock().unwrap().len(), 1);

        i.process().await;
        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn async_drivers_are_supported() {
        let mut fed = false;
        let mut i = InterfaceBuilder::new("radio", 1000, vec![0])
            .recv_async(move || {
                let first = !fed;
                fed = true;
                Box::pin(async move {
                    first.then(|| Datagram {
                        data: Bytes::from_static(b"x"),
                        intrfc_id: None,
                        addr: None,
                    })
                })
            })
            .send_async(|_| Box::pin(async {}))
            .broadcast_sync(|_| {})
            .build()
            .unwrap();

        i.process().await;
        assert!(i.receive().is_some());
        assert!(i.receive().is_none());
    }

    #[tokio::test]
    async fn loopback_round_trips() {
        let mut lo = Interface::loopback();
        let id = lo.id;
        lo.send(Datagram::new(Bytes::from_static(b"ping"), id, None));
        lo.process().await; // flushes outbox into the line
        lo.process().await; // drains the line into the inbox
        let d = lo.receive().expect("datagram came back");
        assert_eq!(d.data, Bytes::from_static(b"ping"));
    }

    #[test]
    fn boxes_are_bounded() {
        let mut i = null_builder("radio").build().unwrap();
        let id = i.id;
        for n in 0..300u32 {
            i.send(Datagram::new(Bytes::copy_from_slice(&n.to_be_bytes()), id, None));
        }
        assert_eq!(i.outbox.len(), BOX_CAP);
        // oldest displaced, newest kept
        let last = i.outbox.back().unwrap();
        assert_eq!(last.data.as_ref(), 299u32.to_be_bytes());
    }
}
