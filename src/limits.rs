pub const MAX_UNITS_PER_BOOK: usize = 10_000;
pub const MAX_BOOKINGS_PER_UNIT: usize = 1_000_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTE_LEN: usize = 1024;
pub const MAX_REASON_LEN: usize = 512;
pub const MAX_HOLDER_LEN: usize = 256;
/// Longest series range, inclusive of both ends.
pub const MAX_SERIES_DAYS: i64 = 366;
/// Farthest ahead a single admission may be placed.
pub const MAX_BOOKING_HORIZON_DAYS: i64 = 730;
pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
