use std::collections::HashMap;

/// Identity shared by the members of one hard link group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum LinkKey {
    Inode {
        dev_major: u32,
        dev_minor: u32,
        ino: u32,
    },
    Group(u32),
}

#[derive(Debug)]
struct PendingGroup {
    expected: usize,
    members: Vec<usize>,
}

/// Buffers group members until the one carrying the content arrives.
#[derive(Debug, Default)]
pub(crate) struct LinkTracker {
    groups: HashMap<LinkKey, PendingGroup>,
}

impl LinkTracker {
    /// Records `index` as a member of `key`. Returns every member, in arrival
    /// order, once the group resolves: either this member carries content or
    /// it is the last of `expected` members.
    pub(crate) fn add(
        &mut self,
        key: LinkKey,
        expected: usize,
        index: usize,
        carries_content: bool,
    ) -> Option<Vec<usize>> {
        let group = self.groups.entry(key).or_insert_with(|| PendingGroup {
            expected,
            members: Vec::new(),
        });
        group.members.push(index);
        if carries_content || group.members.len() >= group.expected {
            return self.groups.remove(&key).map(|group| group.members);
        }
        None
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Groups still waiting for content, ordered by their first member.
    pub(crate) fn drain_unresolved(&mut self) -> Vec<Vec<usize>> {
        let mut groups = self
            .groups
            .drain()
            .map(|(_, group)| group.members)
            .collect::<Vec<_>>();
        groups.sort_by_key(|members| members.first().copied());
        groups
    }
}
