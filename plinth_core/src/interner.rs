use fxhash::FxHashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::OnceLock;

/// An interned string handle. Copying the handle is free and equality is
/// id equality: two handles are equal if and only if their texts are equal.
///
/// Id zero is reserved for the empty string so that zero-initialised record
/// memory holds a valid handle. Ordering is lexicographic over the interned
/// text, which is what interval indices and deterministic tie-breaks need.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct InternedString(u32);

struct Interner {
    ids: FxHashMap<&'static str, InternedString>,
    texts: Vec<&'static str>,
}

fn interner() -> &'static RwLock<Interner> {
    static INTERNER: OnceLock<RwLock<Interner>> = OnceLock::new();
    INTERNER.get_or_init(|| {
        RwLock::new(Interner {
            ids: FxHashMap::default(),
            texts: vec![""],
        })
    })
}

impl InternedString {
    pub fn new(text: &str) -> Self {
        if text.is_empty() {
            return InternedString(0);
        }

        {
            let lock = interner().read();
            if let Some(id) = lock.ids.get(text) {
                return *id;
            }
        }

        let mut lock = interner().write();
        if let Some(id) = lock.ids.get(text) {
            return *id;
        }

        // Interned texts live for the duration of the process.
        let leaked: &'static str = Box::leak(text.to_string().into_boxed_str());
        let id = InternedString(lock.texts.len() as u32);
        lock.texts.push(leaked);
        lock.ids.insert(leaked, id);
        id
    }

    pub fn as_str(self) -> &'static str {
        interner().read().texts[self.0 as usize]
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl From<&str> for InternedString {
    fn from(text: &str) -> Self {
        InternedString::new(text)
    }
}

impl PartialOrd for InternedString {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternedString {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if self.0 == other.0 {
            std::cmp::Ordering::Equal
        } else {
            self.as_str().cmp(other.as_str())
        }
    }
}

impl fmt::Display for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// Shorthand used throughout storage and query construction.
pub fn intern(text: &str) -> InternedString {
    InternedString::new(text)
}
