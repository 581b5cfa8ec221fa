//! Data structures for passing keys and values into and out of a batch.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;
use std::mem;
use std::num::NonZeroUsize;

use thiserror::Error;

#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    pub(crate) fn duplicate(&self) -> Self {
        Token(self.0)
    }
}

/// Trait for rows that carry their own lookup key, such as a primary key.
/// Used by [`KeySet::lookup`] to pair fetched rows with requested keys.
pub trait KeyedEntry<Key: ?Sized> {
    fn get_key(&self) -> &Key;
}

/// Error returned by [`KeySet::values_from_vec`] when the batch function
/// produced a different number of values than it was given keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("batch function returned {values} values for {keys} keys")]
pub struct ArityError {
    pub keys: usize,
    pub values: usize,
}

/// A set of keys passed into a batch function. Use the `keys` method to get
/// the keys, in the order they were requested, so that you can execute your
/// query. Then, use one of the `into_*`, `lookup` or `group_by` methods to
/// transform your response data into a [`ValueSet`], which is handed back to
/// the batcher.
///
/// Each key is associated with a Token held by exactly one waiting future.
/// If the same key was requested twice (which only happens when the loader
/// isn't memoizing), it appears twice, in call order.
#[derive(Debug)]
pub struct KeySet<Key> {
    entries: Vec<(Token, Key)>,

    // Tokens are an ever-increasing integer, so a discarded token is never
    // reissued within one KeySet.
    next_token: NonZeroUsize,
}

impl<Key> KeySet<Key> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_token: NonZeroUsize::new(1).unwrap(),
        }
    }

    /// Add a key to this KeySet, and return the token associated with that
    /// request. This token can then be used to pull a value out of the
    /// ValueSet created from this KeySet.
    pub(crate) fn add_key(&mut self, key: Key) -> Token {
        let token = Token(self.next_token);
        self.next_token = self
            .next_token
            .get()
            .checked_add(1)
            .and_then(NonZeroUsize::new)
            .expect("Overflow when creating token");

        self.entries.push((token.duplicate(), key));
        token
    }

    /// Remove the request associated with a token, because its future was
    /// dropped before the batch was dispatched.
    pub(crate) fn discard_token(&mut self, token: &Token) {
        if let Some(index) = self.entries.iter().position(|(t, _)| t == token) {
            self.entries.remove(index);
        }
    }

    /// Take the keyset out of this particular &mut self instance, replacing it
    /// with an empty set. Helper method for when the state transitions out
    /// of Accumulating.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            entries: mem::take(&mut self.entries),
            next_token: self.next_token,
        }
    }

    /// Check if there are any keys in this keyset
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get the number of requested keys in this keyset, duplicates included.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Get an iterator over all the keys in this keyset, in the order they
    /// were requested.
    pub fn keys(&self) -> impl ExactSizeIterator<Item = &Key> + Clone {
        self.entries.iter().map(|(_token, key)| key)
    }

    /// Copy the keys out, in request order. Convenient for building an
    /// `IN (...)` query.
    pub fn to_vec(&self) -> Vec<Key>
    where
        Key: Clone,
    {
        self.keys().cloned().collect()
    }

    /// After you've completed your request, use this method to pair each key
    /// with its value.
    pub fn into_values<Value, Error>(
        self,
        mut get_value: impl FnMut(&Key) -> Value,
    ) -> ValueSet<Value, Error> {
        self.into_results(move |key| Ok(get_value(key)))
    }

    /// Fallible version of into_values. Same as into_values, but will return
    /// an error the first time `get_value` returns an error, failing the
    /// whole batch.
    pub fn try_into_values<Value, Error>(
        self,
        mut get_value: impl FnMut(&Key) -> Result<Value, Error>,
    ) -> Result<ValueSet<Value, Error>, Error> {
        let values: Result<HashMap<Token, Result<Value, Error>>, Error> = self
            .entries
            .into_iter()
            .map(move |(token, key)| Ok((token, Ok(get_value(&key)?))))
            .collect();

        values.map(|values| ValueSet { values })
    }

    /// Pair each key with its own result. An `Err` here is delivered only to
    /// the future waiting on that key; the rest of the batch is unaffected.
    pub fn into_results<Value, Error>(
        self,
        mut get_result: impl FnMut(&Key) -> Result<Value, Error>,
    ) -> ValueSet<Value, Error> {
        let values = self
            .entries
            .into_iter()
            .map(move |(token, key)| {
                let result = get_result(&key);
                (token, result)
            })
            .collect();

        ValueSet { values }
    }

    /// Positional variant, for batch functions that already produce one value
    /// per key in key order.
    pub fn values_from_vec<Value, Error>(
        self,
        values: Vec<Value>,
    ) -> Result<ValueSet<Value, Error>, ArityError> {
        if values.len() != self.entries.len() {
            return Err(ArityError {
                keys: self.entries.len(),
                values: values.len(),
            });
        }

        let values = self
            .entries
            .into_iter()
            .zip(values)
            .map(|((token, _key), value)| (token, Ok(value)))
            .collect();

        Ok(ValueSet { values })
    }
}

impl<Key: Eq + Hash> KeySet<Key> {
    /// Point lookup: pair each key with the row whose own key matches it, or
    /// `None` if the fetch returned no such row. Rows for keys that weren't
    /// requested are ignored. If several rows share a key, the first wins.
    pub fn lookup<Row, Error>(self, rows: impl IntoIterator<Item = Row>) -> ValueSet<Option<Row>, Error>
    where
        Row: KeyedEntry<Key> + Clone,
    {
        let rows: Vec<Row> = rows.into_iter().collect();
        let mut index: HashMap<&Key, usize> = HashMap::with_capacity(rows.len());
        for (position, row) in rows.iter().enumerate() {
            index.entry(row.get_key()).or_insert(position);
        }

        self.into_values(|key| index.get(key).map(|&position| rows[position].clone()))
    }

    /// One-to-many lookup: group rows by the parent key `parent_of` extracts,
    /// then pair each requested key with its group, sorted with `compare`.
    /// Keys with no rows get an empty list. Rows whose parent is `None`
    /// belong to no group and are never returned.
    pub fn group_by<Row, Error>(
        self,
        rows: impl IntoIterator<Item = Row>,
        parent_of: impl Fn(&Row) -> Option<&Key>,
        compare: impl Fn(&Row, &Row) -> Ordering,
    ) -> ValueSet<Vec<Row>, Error>
    where
        Row: Clone,
    {
        let rows: Vec<Row> = rows.into_iter().collect();
        let mut groups: HashMap<&Key, Vec<usize>> = HashMap::new();
        for (position, row) in rows.iter().enumerate() {
            if let Some(parent) = parent_of(row) {
                groups.entry(parent).or_default().push(position);
            }
        }

        for positions in groups.values_mut() {
            // sort_by is stable, so rows that compare equal keep store order
            positions.sort_by(|&a, &b| compare(&rows[a], &rows[b]));
        }

        self.into_values(|key| match groups.get(key) {
            None => Vec::new(),
            Some(positions) => positions
                .iter()
                .map(|&position| rows[position].clone())
                .collect(),
        })
    }
}

/// A value set is an opaque data structure that contains the result of a batch
/// operation. It can only be created from a [`KeySet`], which guarantees that
/// there is exactly one result for every requested key. It is used by the
/// batcher to distribute the results to the correct waiting futures.
#[derive(Debug)]
pub struct ValueSet<Value, Error> {
    values: HashMap<Token, Result<Value, Error>>,
}

impl<Value, Error> ValueSet<Value, Error> {
    /// Number of results still waiting to be taken.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Take the result associated with a token out of this ValueSet.
    pub(crate) fn take(&mut self, token: &Token) -> Option<Result<Value, Error>> {
        self.values.remove(token)
    }

    /// Discard a token associated with this ValueSet without getting the
    /// value. No-op if the token isn't present.
    pub(crate) fn discard(&mut self, token: &Token) {
        self.values.remove(token);
    }
}
