//! Per-receiver packet filters.
//!
//! Filters are registered on a shared session and selected by receivers
//! through a [`FilterId`]. A filter sees every packet sent through the session
//! so it can remember which replies belong to traffic a receiver should not
//! see.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::ddms;
use crate::sync::MutexExt;
use crate::wire::PacketHeader;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FilterId(&'static str);

impl FilterId {
    /// Hides DDMS commands and the replies to DDMS commands.
    pub const NO_DDMS: FilterId = FilterId("no-ddms");

    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

pub trait PacketFilter: Send + Sync {
    fn id(&self) -> FilterId;

    /// Called before a packet is written to the VM.
    fn before_send_packet(&self, _header: &PacketHeader) {}

    /// Called after every receiver has seen a packet read from the VM.
    fn after_receive_packet(&self, _header: &PacketHeader) {}

    /// Whether a receiver using this filter should see the packet.
    fn keep_received_packet(&self, header: &PacketHeader) -> bool;
}

/// Drops DDMS commands and replies to DDMS commands sent through the session.
#[derive(Debug, Default)]
pub struct NoDdmsPacketFilter {
    pending_replies: Mutex<HashSet<u32>>,
}

impl NoDdmsPacketFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PacketFilter for NoDdmsPacketFilter {
    fn id(&self) -> FilterId {
        FilterId::NO_DDMS
    }

    fn before_send_packet(&self, header: &PacketHeader) {
        if ddms::is_ddms_command(header) {
            self.pending_replies
                .lock_or_recover("NoDdmsPacketFilter.pending_replies")
                .insert(header.id());
        }
    }

    fn after_receive_packet(&self, header: &PacketHeader) {
        if header.is_reply() {
            self.pending_replies
                .lock_or_recover("NoDdmsPacketFilter.pending_replies")
                .remove(&header.id());
        }
    }

    fn keep_received_packet(&self, header: &PacketHeader) -> bool {
        if ddms::is_ddms_command(header) {
            return false;
        }
        !(header.is_reply()
            && self
                .pending_replies
                .lock_or_recover("NoDdmsPacketFilter.pending_replies")
                .contains(&header.id()))
    }
}

/// The filters registered on one shared session.
pub(crate) struct FilterSet {
    filters: Vec<Arc<dyn PacketFilter>>,
}

impl FilterSet {
    pub(crate) fn new(extra: impl IntoIterator<Item = Arc<dyn PacketFilter>>) -> Self {
        let mut filters: Vec<Arc<dyn PacketFilter>> = vec![Arc::new(NoDdmsPacketFilter::new())];
        filters.extend(extra);
        Self { filters }
    }

    pub(crate) fn before_send_packet(&self, header: &PacketHeader) {
        for filter in &self.filters {
            filter.before_send_packet(header);
        }
    }

    pub(crate) fn after_receive_packet(&self, header: &PacketHeader) {
        for filter in &self.filters {
            filter.after_receive_packet(header);
        }
    }

    /// Unknown filter ids keep every packet.
    pub(crate) fn keep(&self, id: Option<FilterId>, header: &PacketHeader) -> bool {
        let Some(id) = id else {
            return true;
        };
        match self.filters.iter().find(|filter| filter.id() == id) {
            Some(filter) => filter.keep_received_packet(header),
            None => {
                tracing::warn!(target: crate::LOG_TARGET, filter = %id, "unknown packet filter");
                true
            }
        }
    }
}
