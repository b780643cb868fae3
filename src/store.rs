//! Ownership-tracked storage for discovery batches and read results.
//!
//! Discovered services, characteristics and descriptors live in per-kind arenas and are addressed through
//! generation-checked [`ListHandle`]s, so a released batch can never be read or released a second time through a
//! stale handle. Read results collect in [`AggregationSet`]s that report completion exactly once.

use std::fmt;
use std::marker::PhantomData;

use tracing::warn;

use crate::adapter::ConnectionId;
use crate::error::{Error, ErrorKind};
use crate::service::HandleRange;
use crate::{Characteristic, Descriptor, Result, Service, Uuid};

/// Index-based handle to one list in an [`AttributeStore`].
pub struct ListHandle<T> {
    index: u32,
    generation: u32,
    _kind: PhantomData<fn() -> T>,
}

/// Handle to a connection's service list.
pub type ServiceListHandle = ListHandle<Service>;
/// Handle to one service's characteristic list.
pub type CharacteristicListHandle = ListHandle<Characteristic>;
/// Handle to one characteristic's descriptor list.
pub type DescriptorListHandle = ListHandle<Descriptor>;

impl<T> Clone for ListHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ListHandle<T> {}

impl<T> PartialEq for ListHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for ListHandle<T> {}

impl<T> fmt::Debug for ListHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListHandle({}v{})", self.index, self.generation)
    }
}

/// Result of an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation<H> {
    /// Nothing to allocate (`n == 0`); the caller moves on to the next entity
    Empty,
    /// A fresh, empty allocation
    Allocated(H),
}

/// The key a list is stored under, besides its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    /// The connection itself (service lists)
    Connection,
    /// A service's handle range (characteristic lists)
    Service(HandleRange),
    /// A characteristic value handle (descriptor lists)
    Characteristic(u16),
}

#[derive(Debug)]
struct List<T> {
    conn: ConnectionId,
    owner: Owner,
    capacity: usize,
    items: Vec<T>,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    list: Option<List<T>>,
}

#[doc(hidden)]
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Arena<T> {
    fn insert(&mut self, list: List<T>) -> ListHandle<T> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    list: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.list = Some(list);
        ListHandle {
            index,
            generation: slot.generation,
            _kind: PhantomData,
        }
    }

    fn get(&self, handle: ListHandle<T>) -> Option<&List<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.list.as_ref())
    }

    fn get_mut(&mut self, handle: ListHandle<T>) -> Option<&mut List<T>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.list.as_mut())
    }

    fn remove(&mut self, handle: ListHandle<T>) -> Option<List<T>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let list = slot.list.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(list)
    }

    fn remove_connection(&mut self, conn: ConnectionId) -> usize {
        let mut released = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.list.as_ref().is_some_and(|list| list.conn == conn) {
                slot.list = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                released += 1;
            }
        }
        released
    }

    fn live(&self, conn: ConnectionId) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.list.as_ref().is_some_and(|list| list.conn == conn))
            .count()
    }

    fn find(&self, conn: ConnectionId, owner: Owner) -> Option<ListHandle<T>> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.list
                .as_ref()
                .filter(|list| list.conn == conn && list.owner == owner)
                .map(|_| ListHandle {
                    index: index as u32,
                    generation: slot.generation,
                    _kind: PhantomData,
                })
        })
    }
}

/// Element types that can be stored in an [`AttributeStore`].
pub trait Stored: private::Sealed + Sized {
    #[doc(hidden)]
    fn arena(store: &AttributeStore) -> &Arena<Self>;
    #[doc(hidden)]
    fn arena_mut(store: &mut AttributeStore) -> &mut Arena<Self>;
}

mod private {
    pub trait Sealed {}

    impl Sealed for crate::Service {}
    impl Sealed for crate::Characteristic {}
    impl Sealed for crate::Descriptor {}
}

impl Stored for Service {
    fn arena(store: &AttributeStore) -> &Arena<Self> {
        &store.services
    }

    fn arena_mut(store: &mut AttributeStore) -> &mut Arena<Self> {
        &mut store.services
    }
}

impl Stored for Characteristic {
    fn arena(store: &AttributeStore) -> &Arena<Self> {
        &store.characteristics
    }

    fn arena_mut(store: &mut AttributeStore) -> &mut Arena<Self> {
        &mut store.characteristics
    }
}

impl Stored for Descriptor {
    fn arena(store: &AttributeStore) -> &Arena<Self> {
        &store.descriptors
    }

    fn arena_mut(store: &mut AttributeStore) -> &mut Arena<Self> {
        &mut store.descriptors
    }
}

/// Identifies one [`AggregationSet`] in an [`AttributeStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AggregationId(u32);

/// One expected read result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeValue {
    /// Characteristic type
    pub uuid: Uuid,
    /// Characteristic value handle
    pub handle: u16,
    /// Render the value as hex rather than text
    pub binary: bool,
    /// The value, or `None` if the read failed or has not finished
    pub value: Option<Vec<u8>>,
    complete: bool,
}

impl AttributeValue {
    /// Creates a slot awaiting its read result.
    pub fn pending(uuid: Uuid, handle: u16, binary: bool) -> Self {
        AttributeValue {
            uuid,
            handle,
            binary,
            value: None,
            complete: false,
        }
    }

    /// Returns `true` once a terminal result (success or failure) has been recorded.
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Read results for one service, complete when every slot has a terminal result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationSet {
    conn: ConnectionId,
    service: Uuid,
    slots: Vec<AttributeValue>,
    loaded: usize,
}

impl AggregationSet {
    /// The connection the reads were issued on.
    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    /// The service the attributes belong to.
    pub fn service(&self) -> Uuid {
        self.service
    }

    /// The slots, in the order the reads were issued.
    pub fn slots(&self) -> &[AttributeValue] {
        &self.slots
    }

    /// Number of slots.
    pub fn expected(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots with a terminal result.
    pub fn loaded(&self) -> usize {
        self.loaded
    }

    /// Returns `true` when every slot has a terminal result.
    pub fn is_complete(&self) -> bool {
        self.loaded == self.slots.len()
    }
}

/// Outcome of recording a read result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotUpdate {
    /// The slot already had a terminal result; nothing changed
    Duplicate,
    /// The set is still waiting for other slots
    Pending {
        /// Slots with a terminal result
        loaded: usize,
        /// Total slots
        expected: usize,
    },
    /// This result completed the set
    Completed(AggregationId),
}

/// Arena storage for discovery batches and aggregation sets.
#[derive(Debug, Default)]
pub struct AttributeStore {
    services: Arena<Service>,
    characteristics: Arena<Characteristic>,
    descriptors: Arena<Descriptor>,
    sets: Vec<Option<AggregationSet>>,
}

impl AttributeStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a service list of up to `n` entries for `conn`.
    pub fn allocate_services(&mut self, conn: ConnectionId, n: usize) -> Allocation<ServiceListHandle> {
        self.allocate(conn, Owner::Connection, n)
    }

    /// Reserves a characteristic list of `n` entries for `service`.
    pub fn allocate_characteristics(
        &mut self,
        conn: ConnectionId,
        service: &Service,
        n: usize,
    ) -> Allocation<CharacteristicListHandle> {
        self.allocate(conn, Owner::Service(service.range), n)
    }

    /// Reserves a descriptor list of `n` entries for the characteristic with value handle `characteristic`.
    pub fn allocate_descriptors(
        &mut self,
        conn: ConnectionId,
        characteristic: u16,
        n: usize,
    ) -> Allocation<DescriptorListHandle> {
        self.allocate(conn, Owner::Characteristic(characteristic), n)
    }

    fn allocate<T: Stored>(&mut self, conn: ConnectionId, owner: Owner, n: usize) -> Allocation<ListHandle<T>> {
        if n == 0 {
            return Allocation::Empty;
        }
        Allocation::Allocated(T::arena_mut(self).insert(List {
            conn,
            owner,
            capacity: n,
            items: Vec::with_capacity(n),
        }))
    }

    /// Finds the live list stored for `conn` under `owner`.
    pub fn find<T: Stored>(&self, conn: ConnectionId, owner: Owner) -> Option<ListHandle<T>> {
        T::arena(self).find(conn, owner)
    }

    /// Appends one item. Fails with [`ErrorKind::InvalidParameter`] once the list is at its allocated size.
    pub fn push<T: Stored>(&mut self, handle: ListHandle<T>, item: T) -> Result<()> {
        let list = T::arena_mut(self).get_mut(handle).ok_or_else(stale)?;
        if list.items.len() >= list.capacity {
            return Err(Error::with_message(ErrorKind::InvalidParameter, "list is full"));
        }
        list.items.push(item);
        Ok(())
    }

    /// Fills a list from a discovery result, keeping at most the allocated number of items.
    ///
    /// Returns the number of items stored.
    pub fn fill<T: Stored>(&mut self, handle: ListHandle<T>, items: Vec<T>) -> Result<usize> {
        let list = T::arena_mut(self).get_mut(handle).ok_or_else(stale)?;
        let room = list.capacity - list.items.len();
        if items.len() > room {
            warn!(
                reported = items.len(),
                room, "attribute cache returned more entries than it counted; extra entries dropped"
            );
        }
        list.items.extend(items.into_iter().take(room));
        Ok(list.items.len())
    }

    /// The items of a live list.
    pub fn items<T: Stored>(&self, handle: ListHandle<T>) -> Result<&[T]> {
        T::arena(self)
            .get(handle)
            .map(|list| list.items.as_slice())
            .ok_or_else(stale)
    }

    /// Frees exactly the allocation behind `handle`, returning its items.
    ///
    /// Releasing a handle twice fails with [`ErrorKind::NotFound`].
    pub fn release<T: Stored>(&mut self, handle: ListHandle<T>) -> Result<Vec<T>> {
        T::arena_mut(self).remove(handle).map(|list| list.items).ok_or_else(stale)
    }

    /// Creates an aggregation set for the reads issued on one service.
    pub fn create_aggregation(
        &mut self,
        conn: ConnectionId,
        service: Uuid,
        slots: Vec<AttributeValue>,
    ) -> Allocation<AggregationId> {
        if slots.is_empty() {
            return Allocation::Empty;
        }
        let set = AggregationSet {
            conn,
            service,
            slots,
            loaded: 0,
        };
        let index = match self.sets.iter().position(Option::is_none) {
            Some(index) => {
                self.sets[index] = Some(set);
                index
            }
            None => {
                self.sets.push(Some(set));
                self.sets.len() - 1
            }
        };
        Allocation::Allocated(AggregationId(index as u32))
    }

    /// Records a successful read of `handle` and reports whether its set just completed.
    pub fn append_attribute_value(&mut self, conn: ConnectionId, handle: u16, bytes: &[u8]) -> Result<SlotUpdate> {
        self.complete_slot(conn, handle, Some(bytes.to_vec()))
    }

    /// Records a failed read of `handle`; it still counts toward completion.
    pub fn fail_attribute(&mut self, conn: ConnectionId, handle: u16) -> Result<SlotUpdate> {
        self.complete_slot(conn, handle, None)
    }

    fn complete_slot(&mut self, conn: ConnectionId, handle: u16, value: Option<Vec<u8>>) -> Result<SlotUpdate> {
        let (index, set) = self
            .sets
            .iter_mut()
            .enumerate()
            .find_map(|(index, set)| {
                set.as_mut()
                    .filter(|set| set.conn == conn && set.slots.iter().any(|slot| slot.handle == handle))
                    .map(|set| (index, set))
            })
            .ok_or_else(|| {
                Error::with_message(
                    ErrorKind::NotFound,
                    format!("no pending read for handle 0x{handle:04x} on conn {conn}"),
                )
            })?;

        let Some(slot) = set.slots.iter_mut().find(|slot| slot.handle == handle && !slot.complete) else {
            return Ok(SlotUpdate::Duplicate);
        };
        slot.value = value;
        slot.complete = true;
        set.loaded += 1;

        if set.is_complete() {
            Ok(SlotUpdate::Completed(AggregationId(index as u32)))
        } else {
            Ok(SlotUpdate::Pending {
                loaded: set.loaded,
                expected: set.slots.len(),
            })
        }
    }

    /// Removes an aggregation set, typically right after it completed.
    pub fn take_aggregation(&mut self, id: AggregationId) -> Option<AggregationSet> {
        self.sets.get_mut(id.0 as usize).and_then(Option::take)
    }

    /// Number of aggregation sets still held for `conn`.
    pub fn open_aggregations(&self, conn: ConnectionId) -> usize {
        self.sets.iter().flatten().filter(|set| set.conn == conn).count()
    }

    /// Frees every list and aggregation set owned by `conn`. Returns how many allocations were released.
    pub fn release_connection(&mut self, conn: ConnectionId) -> usize {
        let mut released = self.services.remove_connection(conn)
            + self.characteristics.remove_connection(conn)
            + self.descriptors.remove_connection(conn);
        for entry in self.sets.iter_mut() {
            if entry.as_ref().is_some_and(|set| set.conn == conn) {
                *entry = None;
                released += 1;
            }
        }
        released
    }

    /// Number of live allocations (lists and aggregation sets) owned by `conn`.
    pub fn live_allocations(&self, conn: ConnectionId) -> usize {
        self.services.live(conn) + self.characteristics.live(conn) + self.descriptors.live(conn) + self.open_aggregations(conn)
    }
}

fn stale() -> Error {
    Error::with_message(ErrorKind::NotFound, "stale attribute list handle")
}
