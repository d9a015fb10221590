//! Word identifiers, reserved pseudo-words and n-gram keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// First id handed out to words the user introduces. Stock (corpus) ids are
/// always below this value.
pub const USER_ID_BASE: i64 = 1 << 24;

/// Highest n-gram order tracked.
pub const MAX_ORDER: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WordId(pub i64);

impl WordId {
    pub fn is_reserved(self) -> bool {
        self.0 < 0
    }

    pub fn is_user(self) -> bool {
        self.0 >= USER_ID_BASE
    }
}

impl fmt::Display for WordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Out-of-band tokens with fixed negative ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReservedToken {
    /// Denominator row for word n-grams.
    Total,
    /// Denominator row for cluster n-grams.
    ClusterTotal,
    /// Sentence start.
    Start,
    /// Missing or unusable context.
    NotAvailable,
}

impl ReservedToken {
    pub const ALL: [ReservedToken; 4] = [
        ReservedToken::Total,
        ReservedToken::ClusterTotal,
        ReservedToken::Start,
        ReservedToken::NotAvailable,
    ];

    pub fn id(self) -> WordId {
        match self {
            ReservedToken::Total => WordId(-1),
            ReservedToken::ClusterTotal => WordId(-2),
            ReservedToken::Start => WordId(-3),
            ReservedToken::NotAvailable => WordId(-4),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ReservedToken::Total => "#TOTAL",
            ReservedToken::ClusterTotal => "#CTOTAL",
            ReservedToken::Start => "#START",
            ReservedToken::NotAvailable => "#NA",
        }
    }

    pub fn from_id(id: WordId) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.id() == id)
    }

    /// Reserved names match case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(name))
    }
}

/// An n-gram row key: `[word_or_cluster, ctx1, ctx2]` truncated to the order.
///
/// `ctx1` is the word immediately preceding the keyed word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GramKey {
    ids: [WordId; MAX_ORDER],
    order: u8,
}

impl GramKey {
    /// Build a key of `order` from a head id and context ids. Context slots
    /// beyond `context.len()` are padded with `#NA`.
    pub fn new(head: WordId, context: &[WordId], order: usize) -> Self {
        debug_assert!((1..=MAX_ORDER).contains(&order));
        let na = ReservedToken::NotAvailable.id();
        let mut ids = [na; MAX_ORDER];
        ids[0] = head;
        for (slot, id) in ids.iter_mut().skip(1).zip(context.iter()) {
            *slot = *id;
        }
        // Unused trailing slots are normalised so equal keys hash equally.
        for slot in ids.iter_mut().skip(order) {
            *slot = na;
        }
        Self {
            ids,
            order: order as u8,
        }
    }

    pub fn order(&self) -> usize {
        self.order as usize
    }

    pub fn ids(&self) -> &[WordId] {
        &self.ids[..self.order()]
    }

    /// Same context, different head. Used to derive `#TOTAL` / `#CTOTAL` rows.
    pub fn with_head(&self, head: WordId) -> Self {
        let mut key = *self;
        key.ids[0] = head;
        key
    }

    /// Denominator key for this row.
    pub fn total(&self, cluster: bool) -> Self {
        let token = if cluster {
            ReservedToken::ClusterTotal
        } else {
            ReservedToken::Total
        };
        self.with_head(token.id())
    }
}

impl fmt::Display for GramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, id) in self.ids().iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{id}")?;
        }
        Ok(())
    }
}
