/// System label carried by messages in the inbox.
pub const LABEL_INBOX: &str = "INBOX";
/// System label for deleted messages.
pub const LABEL_TRASH: &str = "TRASH";
/// Local read-state label. Gmail has no READ label; reading removes UNREAD there.
pub const LABEL_READ: &str = "READ";
pub const LABEL_UNREAD: &str = "UNREAD";

/// The field whose literal is a relative time (count plus unit).
pub const RECEIVED_AT_FIELD: &str = "received_at";

pub const DEFAULT_PAGE_LIMIT: u32 = 100;
pub const MAX_PAGE_LIMIT: u32 = 1_000;
