// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Packet-id allocation and correlation (`spec.md` §4.2).
//!
//! Both router flavors are plain structs rather than separate actor tasks:
//! the connection actor that owns a router (`ClientSession`/per-connection
//! `ServerSession` worker, see `session`) already serializes every access
//! to it by construction, since it is the only task holding a `&mut`
//! reference. This is the Open Question resolution recorded in
//! `DESIGN.md` — one actor per connection, not one per packet id or per
//! router.

use std::collections::HashMap;

use mqtt_codec::PacketId;

use crate::error::{Error, ErrorKind};

const WORDS: usize = 1024; // 1024 * 64 = 65536 bits, one per possible id.

/// A bitmap of the 65,536 possible packet ids plus a rotating cursor, used
/// to find the smallest free id in amortized O(1) (`spec.md` §9).
/// Id `0` is never handed out; MQTT packet ids are `1..=65535`.
pub struct PacketIdBitmap {
    words: Box<[u64; WORDS]>,
    cursor: usize,
}

impl PacketIdBitmap {
    pub fn new() -> Self {
        let mut words = Box::new([0u64; WORDS]);
        // Mark id 0 permanently in-use so it is never allocated.
        words[0] |= 1;
        PacketIdBitmap { words, cursor: 0 }
    }

    fn is_set(&self, id: u16) -> bool {
        let id = id as usize;
        self.words[id / 64] & (1 << (id % 64)) != 0
    }

    fn set(&mut self, id: u16) {
        let id = id as usize;
        self.words[id / 64] |= 1 << (id % 64);
    }

    fn clear(&mut self, id: u16) {
        let id = id as usize;
        self.words[id / 64] &= !(1 << (id % 64));
    }

    /// Allocate the smallest free id, starting the search from the
    /// rotating cursor so a long-running session doesn't repeatedly
    /// re-scan ids it knows are in use.
    pub fn alloc(&mut self) -> Option<PacketId> {
        for offset in 0..=u16::MAX as usize {
            let id = ((self.cursor + offset) % (u16::MAX as usize + 1)) as u16;
            if !self.is_set(id) {
                self.set(id);
                self.cursor = id.wrapping_add(1) as usize;
                return Some(id);
            }
        }
        None
    }

    pub fn free(&mut self, id: PacketId) {
        self.clear(id);
    }
}

impl Default for PacketIdBitmap {
    fn default() -> Self {
        Self::new()
    }
}

/// `LocalPacketRouter` (`spec.md` §4.2): *we* allocate the packet id.
pub struct LocalPacketIdRouter<E> {
    bitmap: PacketIdBitmap,
    exchanges: HashMap<PacketId, E>,
}

impl<E> LocalPacketIdRouter<E> {
    pub fn new() -> Self {
        LocalPacketIdRouter {
            bitmap: PacketIdBitmap::new(),
            exchanges: HashMap::new(),
        }
    }

    /// Allocate the smallest free id and store `exchange` under it.
    pub fn register(&mut self, exchange: E) -> Result<PacketId, Error> {
        let id = self.bitmap.alloc().ok_or_else(|| {
            Error::new(
                ErrorKind::NoPacketIdsAvailable,
                "no local packet ids available: 65535 exchanges in flight",
            )
        })?;
        self.exchanges.insert(id, exchange);
        Ok(id)
    }

    pub fn get_mut(&mut self, id: PacketId) -> Option<&mut E> {
        self.exchanges.get_mut(&id)
    }

    pub fn contains(&self, id: PacketId) -> bool {
        self.exchanges.contains_key(&id)
    }

    /// Deliver an event to the stored exchange, freeing the slot if
    /// `is_terminal` reports the exchange reached its terminal state.
    /// Returns `UnknownPacketId` if nothing is registered for `id`.
    pub fn route(
        &mut self,
        id: PacketId,
        is_terminal: impl FnOnce(&E) -> bool,
    ) -> Result<&mut E, Error> {
        if !self.exchanges.contains_key(&id) {
            return Err(Error::new(
                ErrorKind::UnknownPacketId,
                format!("no in-flight exchange for packet id {id}"),
            ));
        }
        if is_terminal(&self.exchanges[&id]) {
            self.exchanges.remove(&id);
            self.bitmap.free(id);
            return Err(Error::new(
                ErrorKind::UnknownPacketId,
                format!("exchange for packet id {id} already terminated"),
            ));
        }
        Ok(self.exchanges.get_mut(&id).expect("checked contains_key above"))
    }

    pub fn deregister(&mut self, id: PacketId) -> Option<E> {
        let exchange = self.exchanges.remove(&id);
        if exchange.is_some() {
            self.bitmap.free(id);
        }
        exchange
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PacketId, &mut E)> {
        self.exchanges.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}

impl<E> Default for LocalPacketIdRouter<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// `RemotePacketRouter` (`spec.md` §4.2): the *peer* chose the packet id.
pub struct RemotePacketIdRouter<E> {
    exchanges: HashMap<PacketId, E>,
}

impl<E> RemotePacketIdRouter<E> {
    pub fn new() -> Self {
        RemotePacketIdRouter {
            exchanges: HashMap::new(),
        }
    }

    /// Store a reservation for `id`. Collides with an existing non-terminal
    /// exchange fails with `DuplicateRemotePacketId`; an existing terminal
    /// exchange is silently overwritten (first-write-wins only applies
    /// while the prior entry is still live, `spec.md` §4.2).
    pub fn register(
        &mut self,
        id: PacketId,
        exchange: E,
        is_terminal: impl Fn(&E) -> bool,
    ) -> Result<(), Error> {
        if let Some(existing) = self.exchanges.get(&id) {
            if !is_terminal(existing) {
                return Err(Error::new(
                    ErrorKind::DuplicateRemotePacketId,
                    format!("packet id {id} already has an in-flight exchange"),
                ));
            }
        }
        self.exchanges.insert(id, exchange);
        Ok(())
    }

    pub fn get_mut(&mut self, id: PacketId) -> Option<&mut E> {
        self.exchanges.get_mut(&id)
    }

    pub fn route(
        &mut self,
        id: PacketId,
        is_terminal: impl FnOnce(&E) -> bool,
    ) -> Result<&mut E, Error> {
        if !self.exchanges.contains_key(&id) {
            return Err(Error::new(
                ErrorKind::UnknownPacketId,
                format!("no in-flight exchange for packet id {id}"),
            ));
        }
        if is_terminal(&self.exchanges[&id]) {
            self.exchanges.remove(&id);
            return Err(Error::new(
                ErrorKind::UnknownPacketId,
                format!("exchange for packet id {id} already terminated"),
            ));
        }
        Ok(self.exchanges.get_mut(&id).expect("checked contains_key above"))
    }

    pub fn deregister(&mut self, id: PacketId) -> Option<E> {
        self.exchanges.remove(&id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PacketId, &mut E)> {
        self.exchanges.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}

impl<E> Default for RemotePacketIdRouter<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_smallest_free_id_first() {
        let mut router: LocalPacketIdRouter<()> = LocalPacketIdRouter::new();
        assert_eq!(router.register(()).unwrap(), 1);
        assert_eq!(router.register(()).unwrap(), 2);
        router.deregister(1);
        assert_eq!(router.register(()).unwrap(), 1);
    }

    #[test]
    fn never_allocates_id_zero() {
        let mut router: LocalPacketIdRouter<()> = LocalPacketIdRouter::new();
        for _ in 0..10 {
            assert_ne!(router.register(()).unwrap(), 0);
        }
    }

    #[test]
    fn exhausting_all_ids_fails_with_no_packet_ids_available() {
        let mut router: LocalPacketIdRouter<()> = LocalPacketIdRouter::new();
        for _ in 0..u16::MAX as usize {
            router.register(()).unwrap();
        }
        assert_eq!(
            router.register(()).unwrap_err().kind(),
            ErrorKind::NoPacketIdsAvailable
        );
    }

    #[test]
    fn remote_router_rejects_duplicate_in_flight_id() {
        let mut router: RemotePacketIdRouter<bool> = RemotePacketIdRouter::new();
        router.register(7, false, |terminal| *terminal).unwrap();
        assert_eq!(
            router
                .register(7, false, |terminal| *terminal)
                .unwrap_err()
                .kind(),
            ErrorKind::DuplicateRemotePacketId
        );
    }

    #[test]
    fn remote_router_allows_overwrite_of_terminal_entry() {
        let mut router: RemotePacketIdRouter<bool> = RemotePacketIdRouter::new();
        router.register(7, true, |terminal| *terminal).unwrap();
        assert!(router.register(7, false, |terminal| *terminal).is_ok());
    }

    #[test]
    fn routing_to_unknown_id_is_an_error() {
        let mut router: LocalPacketIdRouter<()> = LocalPacketIdRouter::new();
        assert_eq!(
            router.route(1, |_| false).unwrap_err().kind(),
            ErrorKind::UnknownPacketId
        );
    }
}
