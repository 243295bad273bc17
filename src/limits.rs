/// Max trips a single tracker will open channels for. Extra trips still
/// render with their declared seat count.
pub const MAX_TRACKED_TRIPS: usize = 512;

/// Upper bound on any seat count or seat delta accepted from the feed.
pub const MAX_SEATS: u32 = 64;

/// Max length of a trip id or availability id used in a channel filter.
pub const MAX_ID_LEN: usize = 128;

/// Default per-channel broadcast buffer for the in-memory feed.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// Versioned deltas remembered per trip while waiting for a newer absolute
/// count. Oldest are forgotten first.
pub const MAX_PENDING_DELTAS: usize = 64;

/// Change ids remembered per trip to drop feed redeliveries. Oldest are
/// forgotten first.
pub const MAX_SEEN_CHANGES: usize = 128;
