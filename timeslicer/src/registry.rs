//! Process-wide table of live counter groups, keyed by their leader fd. The
//! sampling loop is the only reader and writer, so there is no locking.

use std::os::fd::RawFd;

use rustc_hash::FxHashMap;

use timeslicer_perf::counter::CounterGroup;

#[derive(Default)]
pub struct FdRegistry {
    groups: FxHashMap<RawFd, CounterGroup>,
}

impl FdRegistry {
    pub fn insert(&mut self, group: CounterGroup) {
        self.groups.insert(group.leader_fd(), group);
    }

    pub fn get_mut(&mut self, leader_fd: RawFd) -> Option<&mut CounterGroup> {
        self.groups.get_mut(&leader_fd)
    }

    pub fn remove(&mut self, leader_fd: RawFd) -> Option<CounterGroup> {
        self.groups.remove(&leader_fd)
    }

    pub fn find_by_tid(&self, tid: u32) -> Option<RawFd> {
        self.groups
            .values()
            .find(|group| group.tid() == tid)
            .map(|group| group.leader_fd())
    }

    pub fn groups(&self) -> impl Iterator<Item = &CounterGroup> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{FromRawFd, OwnedFd};

    fn group_for(tid: u32) -> CounterGroup {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { libc::close(fds[1]) };
        let leader = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        CounterGroup::from_received_fds(tid, vec![leader], &[]).unwrap()
    }

    #[test]
    fn insert_lookup_remove_round_trip() {
        let mut registry = FdRegistry::default();
        assert!(registry.is_empty());

        let group = group_for(7);
        let fd = group.leader_fd();
        registry.insert(group);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_mut(fd).unwrap().tid(), 7);
        assert_eq!(registry.find_by_tid(7), Some(fd));
        assert_eq!(registry.find_by_tid(8), None);

        let removed = registry.remove(fd).unwrap();
        assert_eq!(removed.tid(), 7);
        assert!(registry.is_empty());
        assert_eq!(removed.leader_fd(), fd);
    }

    #[test]
    fn groups_iterates_everything() {
        let mut registry = FdRegistry::default();
        registry.insert(group_for(1));
        registry.insert(group_for(2));
        let mut tids: Vec<u32> = registry.groups().map(|g| g.tid()).collect();
        tids.sort();
        assert_eq!(tids, vec![1, 2]);
    }
}
