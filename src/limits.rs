use crate::model::Ms;

pub const MAX_TENANTS: usize = 10_000;
pub const MAX_SUBDOMAIN_LEN: usize = 20;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_TEXT_LEN: usize = 2_000;
pub const MAX_URL_LEN: usize = 2_048;
pub const MAX_EMAIL_LEN: usize = 254;

pub const MAX_SERVICES_PER_TENANT: usize = 1_000;
pub const MAX_STAFF_PER_TENANT: usize = 1_000;
pub const MAX_TIME_OFF_PER_STAFF: usize = 5_000;
pub const MAX_BOOKINGS_PER_STAFF: usize = 200_000;

pub const MAX_SERVICE_DURATION_MINUTES: u32 = 24 * 60;
pub const MIN_SLOT_STEP_MINUTES: u32 = 5;
pub const MAX_SLOT_STEP_MINUTES: u32 = 24 * 60;
pub const MAX_TIME_OFF_DAYS: i64 = 366;
pub const MAX_DENSITY_WINDOW_DAYS: i64 = 366;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
