/// mDNS service type advertised by HAP accessory servers
pub const HAP_SERVICE_TYPE: &str = "_hap._tcp.local.";

/// TXT record keys used in HAP advertisements
pub const TXT_DEVICE_ID: &str = "id";
pub const TXT_MODEL: &str = "md";

/// Header carrying the shared pin on writes
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Content type used by HAP for JSON bodies
pub const HAP_JSON_CONTENT_TYPE: &str = "application/hap+json";

/// First token of an unsolicited push message, e.g. `EVENT/1.0 200 OK`
pub const EVENT_TOKEN: &str = "EVENT";

/// HTTP status returned when the pin is rejected
pub const STATUS_UNAUTHORIZED: u16 = 401;

/// HAP status code for "insufficient authorization", sent as HTTP status by some bridges
pub const STATUS_HAP_INSUFFICIENT_AUTHORIZATION: u16 = 470;

/// Reserved identifier used for the credential check write. No accessory uses it.
pub const PROBE_ID: i64 = -1;
