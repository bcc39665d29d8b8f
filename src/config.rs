use crate::socks5::protocol::AuthMethod;
use crate::users::UserPass;
use std::time::Duration;

/// Config holds the startup configuration of the proxy
#[derive(Debug, Clone)]
pub struct Config {
    /// SOCKS5 listener address
    pub listen_addr: String,

    /// Management listener address
    pub mgmt_addr: String,

    /// Regular users allowed to use the proxy
    pub users: Vec<UserPass>,

    /// Administrators allowed to use the proxy and the management protocol
    pub admins: Vec<UserPass>,

    /// Accept clients without authentication even when users are configured
    pub force_no_auth: bool,

    /// Whether POP3 credential sniffing starts enabled
    pub dissector_enabled: bool,

    /// Capacity of each per-connection buffer
    pub buffer_size: usize,

    /// Upper bound on a single selector wait
    pub select_timeout: Duration,
}

/// Config implementation block
impl Config {
    /// new is a constructor for the Config type
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            mgmt_addr: "127.0.0.1:8080".to_string(),
            users: Vec::new(),
            admins: Vec::new(),
            force_no_auth: false,
            dissector_enabled: true,
            buffer_size: 4096,
            select_timeout: Duration::from_secs(10),
        }
    }

    /// with_mgmt_addr sets the management listener address
    pub fn with_mgmt_addr(mut self, addr: impl Into<String>) -> Self {
        self.mgmt_addr = addr.into();
        self
    }

    /// with_user adds a regular user
    pub fn with_user(mut self, user: UserPass) -> Self {
        self.users.push(user);
        self
    }

    /// with_admin adds an administrator
    pub fn with_admin(mut self, admin: UserPass) -> Self {
        self.admins.push(admin);
        self
    }

    /// initial_settings derives the runtime settings the server starts with:
    /// authentication is required as soon as any account exists
    pub fn initial_settings(&self) -> Settings {
        let has_accounts = !self.users.is_empty() || !self.admins.is_empty();
        Settings {
            auth_required: has_accounts && !self.force_no_auth,
            dissector_enabled: self.dissector_enabled,
        }
    }
}

/// Settings are the knobs the management protocol can flip at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub auth_required: bool,
    pub dissector_enabled: bool,
}

impl Settings {
    /// required_method is the single method new SOCKS clients must offer
    pub fn required_method(&self) -> AuthMethod {
        if self.auth_required {
            AuthMethod::UserPass
        } else {
            AuthMethod::NoAuth
        }
    }
}
