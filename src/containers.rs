//! Container data structures shared across the analyses

pub mod unordered {
    #[cfg(not(feature = "deterministic_containers"))]
    type BaseMap<K, V> = std::collections::HashMap<K, V>;
    #[cfg(feature = "deterministic_containers")]
    type BaseMap<K, V> = std::collections::BTreeMap<K, V>;
    #[cfg(not(feature = "deterministic_containers"))]
    pub type UnorderedMapEntry<'a, K, V> = std::collections::hash_map::Entry<'a, K, V>;
    #[cfg(feature = "deterministic_containers")]
    pub type UnorderedMapEntry<'a, K, V> = std::collections::btree_map::Entry<'a, K, V>;
    #[cfg(not(feature = "deterministic_containers"))]
    type BaseSet<T> = std::collections::HashSet<T>;
    #[cfg(feature = "deterministic_containers")]
    type BaseSet<T> = std::collections::BTreeSet<T>;

    /// An unordered map type. This type specifies the _intention_ of unorderedness, but allows the
    /// crate's features to dictate whether it actually use non-determinism at runtime.
    ///
    /// This type is meant to aid in debugging. Thus, it also ensures that its debug view is always
    /// ordered.
    #[derive(Clone, PartialEq, Eq)]
    pub struct UnorderedMap<K: std::hash::Hash + Ord + Eq, V> {
        map: BaseMap<K, V>,
    }

    impl<K: std::hash::Hash + Ord + Eq, V> UnorderedMap<K, V> {
        /// Make a new, empty unordered map
        pub fn new() -> Self {
            Self {
                map: Default::default(),
            }
        }

        /// Get an iterator over the entries of the map.
        pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
            self.map.iter()
        }

        /// Returns `true` if the map contains a value for the specified key.
        pub fn contains_key<Q: ?Sized>(&self, k: &Q) -> bool
        where
            K: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.map.contains_key(k)
        }

        /// Returns a reference to the value corresponding to the key.
        pub fn get<Q: ?Sized>(&self, k: &Q) -> Option<&V>
        where
            K: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.map.get(k)
        }

        /// Returns a mutable reference to the value corresponding to the key.
        pub fn get_mut<Q: ?Sized>(&mut self, k: &Q) -> Option<&mut V>
        where
            K: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.map.get_mut(k)
        }

        /// Inserts a key-value pair into the map, returning the previous value at the key if there
        /// was one.
        pub fn insert(&mut self, k: K, v: V) -> Option<V> {
            self.map.insert(k, v)
        }

        /// Removes a key from the map, returning the value at the key if the key was previously in
        /// the map.
        pub fn remove<Q: ?Sized>(&mut self, k: &Q) -> Option<V>
        where
            K: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.map.remove(k)
        }

        /// Gets the given key's corresponding entry in the map for in-place manipulation.
        pub fn entry(&mut self, key: K) -> UnorderedMapEntry<'_, K, V> {
            self.map.entry(key)
        }

        /// An iterator visiting all keys in arbitrary order.
        pub fn keys(&self) -> impl Iterator<Item = &K> {
            self.map.keys()
        }

        /// An iterator visiting all values in arbitrary order.
        pub fn values(&self) -> impl Iterator<Item = &V> {
            self.map.values()
        }

        /// Returns the number of elements in the map.
        pub fn len(&self) -> usize {
            self.map.len()
        }

        /// Returns `true` if the map contains no elements.
        pub fn is_empty(&self) -> bool {
            self.map.is_empty()
        }
    }

    impl<K: std::hash::Hash + Ord + Eq, V> Default for UnorderedMap<K, V> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<K: std::hash::Hash + Ord + Eq, V> FromIterator<(K, V)> for UnorderedMap<K, V> {
        fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
            Self {
                map: BaseMap::from_iter(iter),
            }
        }
    }

    impl<K: std::hash::Hash + Ord + Eq + std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug
        for UnorderedMap<K, V>
    {
        #[cfg(not(feature = "deterministic_containers"))]
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            self.map
                .iter()
                .collect::<std::collections::BTreeMap<_, _>>()
                .fmt(f)
        }
        #[cfg(feature = "deterministic_containers")]
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            self.map.fmt(f)
        }
    }

    impl<K: std::hash::Hash + Ord + Eq, V> IntoIterator for UnorderedMap<K, V> {
        type Item = (K, V);
        type IntoIter = <BaseMap<K, V> as IntoIterator>::IntoIter;

        fn into_iter(self) -> Self::IntoIter {
            self.map.into_iter()
        }
    }
    impl<'a, K: std::hash::Hash + Ord + Eq, V> IntoIterator for &'a UnorderedMap<K, V> {
        type Item = (&'a K, &'a V);
        type IntoIter = <&'a BaseMap<K, V> as IntoIterator>::IntoIter;

        fn into_iter(self) -> Self::IntoIter {
            self.map.iter()
        }
    }

    /// An unordered set type. This type specifies the _intention_ of unorderedness, but allows the
    /// crate's features to dictate whether it actually use non-determinism at runtime.
    ///
    /// This type is meant to aid in debugging. Thus, it also ensures that its debug view is always
    /// ordered.
    #[derive(Clone, PartialEq, Eq)]
    pub struct UnorderedSet<T: std::hash::Hash + Ord + Eq> {
        set: BaseSet<T>,
    }

    impl<T: std::hash::Hash + Ord + Eq> UnorderedSet<T> {
        /// Make a new, empty unordered set
        pub fn new() -> Self {
            Self {
                set: BaseSet::new(),
            }
        }

        /// Adds a value to the set, returning `true` if it was not already present.
        pub fn insert(&mut self, value: T) -> bool {
            self.set.insert(value)
        }

        /// Removes a value from the set. Returns whether the value was present in the set.
        pub fn remove<Q: ?Sized>(&mut self, value: &Q) -> bool
        where
            T: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.set.remove(value)
        }

        /// Get an iterator over the elements of the set.
        pub fn iter(&self) -> impl Iterator<Item = &T> {
            self.set.iter()
        }

        /// Returns `true` if the set contains a value.
        pub fn contains<Q: ?Sized>(&self, value: &Q) -> bool
        where
            T: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.set.contains(value)
        }

        /// Returns the number of elements in the set.
        pub fn len(&self) -> usize {
            self.set.len()
        }

        /// Returns `true` if the set contains no elements.
        pub fn is_empty(&self) -> bool {
            self.set.is_empty()
        }

        /// Visits the values representing the union, i.e., all the values in `self` or `other`,
        /// without duplicates.
        pub fn union<'a>(&'a self, other: &'a Self) -> impl Iterator<Item = &'a T> {
            self.set.union(&other.set)
        }
    }

    impl<T: std::hash::Hash + Ord + Eq> Default for UnorderedSet<T> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<T: std::hash::Hash + Ord + Eq + std::fmt::Debug> std::fmt::Debug for UnorderedSet<T> {
        #[cfg(not(feature = "deterministic_containers"))]
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            self.set
                .iter()
                .collect::<std::collections::BTreeSet<_>>()
                .fmt(f)
        }
        #[cfg(feature = "deterministic_containers")]
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            self.set.fmt(f)
        }
    }

    impl<T: std::hash::Hash + Ord + Eq> Extend<T> for UnorderedSet<T> {
        fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
            self.set.extend(iter);
        }
    }
    impl<'a, T: 'a + std::hash::Hash + Ord + Eq + Copy> Extend<&'a T> for UnorderedSet<T> {
        fn extend<I: IntoIterator<Item = &'a T>>(&mut self, iter: I) {
            self.set.extend(iter);
        }
    }

    impl<T: std::hash::Hash + Ord + Eq> IntoIterator for UnorderedSet<T> {
        type Item = T;
        type IntoIter = <BaseSet<T> as IntoIterator>::IntoIter;

        fn into_iter(self) -> Self::IntoIter {
            self.set.into_iter()
        }
    }
    impl<'a, T: std::hash::Hash + Ord + Eq> IntoIterator for &'a UnorderedSet<T> {
        type Item = &'a T;
        type IntoIter = <&'a BaseSet<T> as IntoIterator>::IntoIter;

        fn into_iter(self) -> Self::IntoIter {
            self.set.iter()
        }
    }

    impl<T: std::hash::Hash + Ord + Eq> FromIterator<T> for UnorderedSet<T> {
        fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
            Self {
                set: BaseSet::from_iter(iter),
            }
        }
    }
}
