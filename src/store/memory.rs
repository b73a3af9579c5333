use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use crate::error::StoreError;
use crate::store::{CoordinationStore, CounterValue};

#[derive(Debug, Clone)]
enum Data {
    Str(String),
    List(VecDeque<String>),
    Set(HashSet<String>),
    Index(HashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(data: Data, ttl: Option<Duration>) -> Self {
        Self {
            data,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!("WRONGTYPE operation against key '{}' holding the wrong kind of value", key))
}

/// In-process coordination store.
///
/// Keeps the same semantics as the Redis store (TTLs, conditional writes,
/// list and index ordering) so a single node or a test can run the whole
/// coordination layer without an external server. Expired keys are dropped
/// lazily when touched.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    // Serialises list operations so a pop-and-push move is never observed half done.
    lists: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn list_guard(&self) -> MutexGuard<'_, ()> {
        self.lists.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn list_len_pair(&self, first: &str, second: &str) -> usize {
        let _guard = self.list_guard();
        self.list_len_locked(first).unwrap_or(0) + self.list_len_locked(second).unwrap_or(0)
    }

    fn push_head_locked(&self, list: &str, value: &str) -> Result<(), StoreError> {
        self.with_entry(list, || Data::List(VecDeque::new()), |data| match data {
            Data::List(l) => {
                l.push_front(value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(list)),
        })
    }

    fn pop_tail_locked(&self, list: &str) -> Result<Option<String>, StoreError> {
        self.purge_if_expired(list);
        let popped = match self.entries.get_mut(list) {
            Some(mut e) => match &mut e.data {
                Data::List(l) => l.pop_back(),
                _ => return Err(wrong_type(list)),
            },
            None => None,
        };
        self.drop_if_empty(list);
        Ok(popped)
    }

    fn list_len_locked(&self, list: &str) -> Result<usize, StoreError> {
        self.read(list, |data| match data {
            None => Ok(0),
            Some(Data::List(l)) => Ok(l.len()),
            Some(_) => Err(wrong_type(list)),
        })
    }

    fn purge_if_expired(&self, key: &str) {
        self.entries.remove_if(key, |_, e| e.is_expired());
    }

    /// Runs `f` on the live entry for `key`, creating it with `init` if needed.
    fn with_entry<R>(
        &self,
        key: &str,
        init: impl FnOnce() -> Data,
        f: impl FnOnce(&mut Data) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.purge_if_expired(key);
        let mut entry = self.entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(init(), None));
        f(&mut entry.data)
    }

    fn read<R>(&self, key: &str, f: impl FnOnce(Option<&Data>) -> Result<R, StoreError>) -> Result<R, StoreError> {
        self.purge_if_expired(key);
        match self.entries.get(key) {
            Some(e) => f(Some(&e.data)),
            None => f(None),
        }
    }

    /// Drops a collection key once it is empty, like Redis does.
    fn drop_if_empty(&self, key: &str) {
        self.entries.remove_if(key, |_, e| match &e.data {
            Data::List(l) => l.is_empty(),
            Data::Set(s) => s.is_empty(),
            Data::Index(i) => i.is_empty(),
            Data::Str(_) => false,
        });
    }

    fn sorted_members(&self, index: &str, descending: bool) -> Result<Vec<String>, StoreError> {
        self.read(index, |data| match data {
            None => Ok(Vec::new()),
            Some(Data::Index(map)) => {
                let mut items: Vec<(&String, &i64)> = map.iter().collect();
                items.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
                if descending {
                    items.reverse();
                }
                Ok(items.into_iter().map(|(m, _)| m.clone()).collect())
            }
            Some(_) => Err(wrong_type(index)),
        })
    }
}

fn slice_inclusive(items: Vec<String>, start: usize, stop: usize) -> Vec<String> {
    if start >= items.len() || stop < start {
        return Vec::new();
    }
    let end = stop.saturating_add(1).min(items.len());
    items[start..end].to_vec()
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.read(key, |data| match data {
            None => Ok(None),
            Some(Data::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            // MGET reports non-string keys as missing instead of failing.
            let value = self.read(key, |data| match data {
                Some(Data::Str(s)) => Ok(Some(s.clone())),
                _ => Ok(None),
            })?;
            values.push(value);
        }
        Ok(values)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), Entry::new(Data::Str(value.to_string()), ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let fresh = Entry::new(Data::Str(value.to_string()), Some(ttl));
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut o) => {
                if o.get().is_expired() {
                    o.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MapEntry::Vacant(v) => {
                v.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let removed = self.entries.remove_if(key, |_, e| {
            !e.is_expired() && matches!(&e.data, Data::Str(s) if s == expected)
        });
        Ok(removed.is_some())
    }

    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.purge_if_expired(key);
        match self.entries.get_mut(key) {
            Some(mut e) => {
                let owned = matches!(&e.data, Data::Str(s) if s == expected);
                if owned {
                    e.expires_at = Some(Instant::now() + ttl);
                }
                Ok(owned)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.purge_if_expired(key);
        Ok(self.entries.contains_key(key))
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut removed = 0;
        for key in keys {
            self.purge_if_expired(key);
            if self.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn push_head(&self, list: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.list_guard();
        self.push_head_locked(list, value)
    }

    async fn pop_tail(&self, list: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.list_guard();
        self.pop_tail_locked(list)
    }

    async fn pop_tail_push_head(&self, source: &str, destination: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.list_guard();
        let Some(value) = self.pop_tail_locked(source)? else {
            return Ok(None);
        };
        self.push_head_locked(destination, &value)?;
        Ok(Some(value))
    }

    async fn list_remove(&self, list: &str, value: &str) -> Result<usize, StoreError> {
        let _guard = self.list_guard();
        self.purge_if_expired(list);
        let removed = match self.entries.get_mut(list) {
            Some(mut e) => match &mut e.data {
                Data::List(l) => match l.iter().position(|v| v == value) {
                    Some(pos) => {
                        l.remove(pos);
                        1
                    }
                    None => 0,
                },
                _ => return Err(wrong_type(list)),
            },
            None => 0,
        };
        self.drop_if_empty(list);
        Ok(removed)
    }

    async fn list_len(&self, list: &str) -> Result<usize, StoreError> {
        let _guard = self.list_guard();
        self.list_len_locked(list)
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.with_entry(set, || Data::Set(HashSet::new()), |data| match data {
            Data::Set(s) => {
                s.insert(member.to_string());
                Ok(())
            }
            _ => Err(wrong_type(set)),
        })
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.purge_if_expired(set);
        if let Some(mut e) = self.entries.get_mut(set) {
            match &mut e.data {
                Data::Set(s) => {
                    s.remove(member);
                }
                _ => return Err(wrong_type(set)),
            }
        }
        self.drop_if_empty(set);
        Ok(())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        self.read(set, |data| match data {
            None => Ok(Vec::new()),
            Some(Data::Set(s)) => {
                let mut members: Vec<String> = s.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(wrong_type(set)),
        })
    }

    async fn index_put(&self, index: &str, member: &str, score: i64) -> Result<(), StoreError> {
        self.with_entry(index, || Data::Index(HashMap::new()), |data| match data {
            Data::Index(map) => {
                map.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(wrong_type(index)),
        })
    }

    async fn index_range_desc(&self, index: &str, start: usize, stop: usize) -> Result<Vec<String>, StoreError> {
        Ok(slice_inclusive(self.sorted_members(index, true)?, start, stop))
    }

    async fn index_range_asc(&self, index: &str, start: usize, stop: usize) -> Result<Vec<String>, StoreError> {
        Ok(slice_inclusive(self.sorted_members(index, false)?, start, stop))
    }

    async fn index_remove(&self, index: &str, members: &[String]) -> Result<usize, StoreError> {
        self.purge_if_expired(index);
        let removed = match self.entries.get_mut(index) {
            Some(mut e) => match &mut e.data {
                Data::Index(map) => members.iter().filter(|m| map.remove(m.as_str()).is_some()).count(),
                _ => return Err(wrong_type(index)),
            },
            None => 0,
        };
        self.drop_if_empty(index);
        Ok(removed)
    }

    async fn index_len(&self, index: &str) -> Result<usize, StoreError> {
        self.read(index, |data| match data {
            None => Ok(0),
            Some(Data::Index(map)) => Ok(map.len()),
            Some(_) => Err(wrong_type(index)),
        })
    }

    async fn decrement_counter(&self, key: &str) -> Result<CounterValue, StoreError> {
        match self.entries.entry(key.to_string()) {
            MapEntry::Vacant(_) => Ok(CounterValue::Absent),
            MapEntry::Occupied(mut o) => {
                if o.get().is_expired() {
                    o.remove();
                    return Ok(CounterValue::Absent);
                }
                let parsed = match &o.get().data {
                    Data::Str(s) if !s.starts_with('+') => s.parse::<i64>().ok(),
                    _ => None,
                };
                match parsed {
                    None => {
                        o.remove();
                        Ok(CounterValue::Corrupt)
                    }
                    Some(current) => {
                        let next = current - 1;
                        if next <= 0 {
                            o.remove();
                            Ok(CounterValue::Remaining(0))
                        } else {
                            o.get_mut().data = Data::Str(next.to_string());
                            Ok(CounterValue::Remaining(next as u64))
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_respects_ttl() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("k", "a", Duration::from_millis(50)).await.unwrap());
        assert!(!store.set_if_absent("k", "b", Duration::from_millis(50)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(store.set_if_absent("k", "b", Duration::from_millis(50)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn conditional_delete_and_expire_check_the_owner() {
        let store = MemoryStore::new();
        store.set("k", "owner", None).await.unwrap();
        assert!(!store.delete_if_equals("k", "intruder").await.unwrap());
        assert!(!store.expire_if_equals("k", "intruder", Duration::from_secs(1)).await.unwrap());
        assert!(store.expire_if_equals("k", "owner", Duration::from_secs(1)).await.unwrap());
        assert!(store.delete_if_equals("k", "owner").await.unwrap());
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn lists_are_fifo_between_head_and_tail() {
        let store = MemoryStore::new();
        store.push_head("q", "1").await.unwrap();
        store.push_head("q", "2").await.unwrap();
        store.push_head("q", "3").await.unwrap();

        assert_eq!(store.pop_tail("q").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.pop_tail_push_head("q", "p").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.list_len("p").await.unwrap(), 1);
        assert_eq!(store.list_remove("p", "2").await.unwrap(), 1);
        assert_eq!(store.pop_tail("q").await.unwrap().as_deref(), Some("3"));
        assert_eq!(store.pop_tail("q").await.unwrap(), None);
        assert!(!store.exists("p").await.unwrap());
    }

    #[tokio::test]
    async fn index_orders_by_score_then_member() {
        let store = MemoryStore::new();
        store.index_put("idx", "b", 10).await.unwrap();
        store.index_put("idx", "a", 10).await.unwrap();
        store.index_put("idx", "c", 30).await.unwrap();
        store.index_put("idx", "d", 20).await.unwrap();

        assert_eq!(store.index_range_asc("idx", 0, 10).await.unwrap(), vec!["a", "b", "d", "c"]);
        assert_eq!(store.index_range_desc("idx", 0, 1).await.unwrap(), vec!["c", "d"]);
        assert_eq!(store.index_range_desc("idx", 4, 8).await.unwrap(), Vec::<String>::new());

        let removed = store.index_remove("idx", &["a".to_string(), "zz".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.index_len("idx").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn counter_deletes_at_zero_and_heals_garbage() {
        let store = MemoryStore::new();
        store.set("c", "2", None).await.unwrap();
        assert_eq!(store.decrement_counter("c").await.unwrap(), CounterValue::Remaining(1));
        assert_eq!(store.decrement_counter("c").await.unwrap(), CounterValue::Remaining(0));
        assert_eq!(store.decrement_counter("c").await.unwrap(), CounterValue::Absent);

        for bad in ["not-a-number", "1.5", " 5", "+5"] {
            store.set("c", bad, None).await.unwrap();
            assert_eq!(store.decrement_counter("c").await.unwrap(), CounterValue::Corrupt, "{bad:?}");
            assert!(!store.exists("c").await.unwrap());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn moving_between_lists_never_hides_an_item() {
        let store = std::sync::Arc::new(MemoryStore::new());
        for i in 0..50 {
            store.push_head("a", &i.to_string()).await.unwrap();
        }

        let movers: Vec<_> = [("a", "b"), ("b", "a"), ("a", "b"), ("b", "a")]
            .into_iter()
            .map(|(from, to)| {
                let store = store.clone();
                tokio::spawn(async move {
                    for _ in 0..200 {
                        store.pop_tail_push_head(from, to).await.unwrap();
                    }
                })
            })
            .collect();
        for _ in 0..200 {
            assert_eq!(store.list_len_pair("a", "b"), 50);
            tokio::task::yield_now().await;
        }
        for mover in movers {
            mover.await.unwrap();
        }
        assert_eq!(store.list_len_pair("a", "b"), 50);
    }

    #[tokio::test]
    async fn wrong_type_is_a_command_error() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        let err = store.push_head("k", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::Command(_)));
    }
}
