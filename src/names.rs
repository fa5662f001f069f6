/// Friendly local-parts and random passwords for generated accounts
use rand::Rng;

const NAMES: &[&str] = &[
    "abel", "abreu", "acevedo", "adrian", "aguilera", "alexis", "andy", "angelo", "anthony",
    "ashley", "avellanet", "blass", "blazquez", "cancel", "carlos", "cesar", "charlie", "daniel",
    "didier", "edward", "farrait", "fernando", "galindo", "garcia", "gomez", "grullon",
    "hernandez", "johnny", "jonathan", "lopez", "lozada", "martin", "masso", "melendez", "miguel",
    "montenegro", "nefty", "olivares", "oscar", "ralphy", "rawy", "ray", "raymond", "rene",
    "reyes", "ricky", "robert", "robi", "rodriguez", "rosa", "rossello", "roy", "ruben", "ruiz",
    "sallaberry", "serbia", "sergio", "talamantez", "torres", "weider", "xavier",
];

const PASSWORD_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz1234567890";

/// Default generated password length
pub const DEFAULT_PASSWORD_LENGTH: usize = 16;

/// Stateless generator bound to an email domain
#[derive(Debug, Clone)]
pub struct NameGenerator {
    domain: String,
    password_length: usize,
}

impl NameGenerator {
    pub fn new(domain: impl Into<String>, password_length: usize) -> Self {
        Self {
            domain: domain.into(),
            password_length,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Pick a random friendly local-part
    pub fn random_name(&self) -> &'static str {
        NAMES[rand::thread_rng().gen_range(0..NAMES.len())]
    }

    /// Build `<name><sequence>@<domain>`
    ///
    /// Uniqueness comes from the sequence, never from the name.
    pub fn email_for(&self, name: &str, sequence: u64) -> String {
        format!("{}{}@{}", name, sequence, self.domain)
    }

    /// Email for the given sequence number with a random friendly name
    pub fn next_email(&self, sequence: u64) -> String {
        self.email_for(self.random_name(), sequence)
    }

    pub fn random_password(&self) -> String {
        random_password(self.password_length)
    }
}

/// Password drawn uniformly from the alphanumeric alphabet
pub fn random_password(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| PASSWORD_CHARS[rng.gen_range(0..PASSWORD_CHARS.len())] as char)
        .collect()
}
