use rand::Rng;

const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Source of unique message ids.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

impl<F> IdGenerator for F
where
    F: Fn() -> String + Send + Sync,
{
    fn generate(&self) -> String {
        self()
    }
}

/// Short random alphanumeric ids, 7 characters by default.
#[derive(Clone, Copy, Debug)]
pub struct NanoId {
    len: usize,
}

impl NanoId {
    pub const DEFAULT_LEN: usize = 7;

    pub fn with_len(len: usize) -> Self {
        Self { len: len.max(1) }
    }
}

impl Default for NanoId {
    fn default() -> Self {
        Self::with_len(Self::DEFAULT_LEN)
    }
}

impl IdGenerator for NanoId {
    fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.len)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    }
}
