/* Imports */
use std::collections::{HashMap, VecDeque};
use std::env;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::{Deref, Index, IndexMut};
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Instant;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use ordered_float::OrderedFloat;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/* Constants */
const K_DEFAULT_PORT: u16 = 1234;
const K_MAX_MSG: usize = 32 << 20; // 32 MiB frame cap
const K_MAX_ARGS: usize = 200_000;
const K_READ_CHUNK: usize = 64 * 1024;
/// Maximum load factor for the chaining hash tables.
/// A value > 1 is valid because multiple items can occupy one bucket.
const K_MAX_LOAD_FACTOR: usize = 8;
const K_REHASHING_WORK: usize = 128;
const K_MAX_WORKS: usize = 2000;
const K_LARGE_CONTAINER_SIZE: usize = 10_000;
const K_MAX_TIMER_WAIT_MS: u64 = 10_000;
const K_NUM_WORKERS: usize = 4;

// null index for all arena-linked structures
const NIL: u32 = u32::MAX;

/* Response status codes */
const RES_OK: u32 = 0;
const RES_ERR: u32 = 1;
const RES_NX: u32 = 2;

/* Byte buffer */
#[derive(Debug)]
struct Buffer {
    data: Vec<u8>,
    start: usize, // beginning of valid data
    end: usize,   // end of valid data (exclusive)
}

impl Buffer {
    fn new() -> Self {
        Self {
            data: Vec::with_capacity(4096),
            start: 0,
            end: 0,
        }
    }

    fn data(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    fn len(&self) -> usize {
        self.end - self.start
    }

    fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn append(&mut self, data: &[u8]) {
        let needed = data.len();
        if self.end + needed > self.data.capacity() {
            self.make_room(needed);
        }
        if self.end + needed > self.data.len() {
            self.data.resize(self.end + needed, 0);
        }
        self.data[self.end..self.end + needed].copy_from_slice(data);
        self.end += needed;
    }

    // Remove n bytes from the front without shifting the rest.
    fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "cannot consume more bytes than available");
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    // Make room by moving the live region to the front, or by reallocating.
    fn make_room(&mut self, needed: usize) {
        let current_len = self.len();
        let available_at_end = self.data.capacity() - self.end;
        if self.start + available_at_end >= needed {
            if current_len > 0 {
                self.data.copy_within(self.start..self.end, 0);
            }
            self.start = 0;
            self.end = current_len;
        } else {
            let new_capacity = (self.data.capacity() * 2).max(current_len + needed);
            let mut new_data = Vec::with_capacity(new_capacity);
            new_data.extend_from_slice(&self.data[self.start..self.end]);
            self.data = new_data;
            self.start = 0;
            self.end = current_len;
        }
    }

    fn append_u32(&mut self, v: u32) {
        self.append(&v.to_le_bytes());
    }

    fn append_i64(&mut self, v: i64) {
        self.append(&v.to_le_bytes());
    }

    fn append_f64(&mut self, v: f64) {
        self.append(&v.to_le_bytes());
    }

    // Reserve the 4-byte length header of a response; patched by response_end().
    fn response_begin(&mut self) -> usize {
        let header_pos = self.len();
        self.append_u32(0);
        header_pos
    }

    fn response_size(&self, header_pos: usize) -> usize {
        self.len() - header_pos - 4
    }

    fn response_end(&mut self, header_pos: usize) {
        let mut msg_size = self.response_size(header_pos);
        if msg_size > K_MAX_MSG {
            // truncate the payload and answer with an error instead
            warn!(size = msg_size, "response too large, replacing with error");
            self.end = self.start + header_pos + 4;
            out_err(self, "response is too big");
            msg_size = self.response_size(header_pos);
        }
        let len_bytes = (msg_size as u32).to_le_bytes();
        self.data[self.start + header_pos..self.start + header_pos + 4].copy_from_slice(&len_bytes);
    }

    // Reserve a u32 element count; patched by arr_end().
    fn arr_begin(&mut self) -> usize {
        let ctx = self.len();
        self.append_u32(0);
        ctx
    }

    fn arr_end(&mut self, ctx: usize, n: u32) {
        self.data[self.start + ctx..self.start + ctx + 4].copy_from_slice(&n.to_le_bytes());
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

/* Slot arena */

// Index-addressed element storage. Freed slots are recycled via a free list,
// so a live index stays stable no matter how the surrounding containers
// relink themselves.
#[derive(Debug)]
struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn alloc(&mut self, val: T) -> u32 {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(val);
            return idx;
        }
        self.slots.push(Some(val));
        (self.slots.len() - 1) as u32
    }

    fn free(&mut self, idx: u32) -> T {
        let val = self.slots[idx as usize]
            .take()
            .expect("arena slot already vacant");
        self.free.push(idx);
        val
    }
}

impl<T> Index<u32> for Arena<T> {
    type Output = T;

    fn index(&self, idx: u32) -> &T {
        self.slots[idx as usize].as_ref().expect("vacant arena slot")
    }
}

impl<T> IndexMut<u32> for Arena<T> {
    fn index_mut(&mut self, idx: u32) -> &mut T {
        self.slots[idx as usize].as_mut().expect("vacant arena slot")
    }
}

fn hash_std(data: &[u8]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}

/* Progressive-rehash hash map */

// Chain linkage lives inside the element; the map only stores indices.
trait HashNode {
    fn hcode(&self) -> u64;
    fn hnext(&self) -> u32;
    fn set_hnext(&mut self, next: u32);
}

#[derive(Debug)]
struct HTab {
    buckets: Vec<u32>, // chain heads, NIL when empty
    mask: u64,
    size: usize,
}

impl HTab {
    fn new(n_buckets: usize) -> Self {
        assert!(n_buckets.is_power_of_two());
        Self {
            buckets: vec![NIL; n_buckets],
            mask: (n_buckets - 1) as u64,
            size: 0,
        }
    }

    fn unused() -> Self {
        Self {
            buckets: Vec::new(),
            mask: 0,
            size: 0,
        }
    }

    fn is_unused(&self) -> bool {
        self.buckets.is_empty()
    }

    fn insert<T: HashNode>(&mut self, arena: &mut Arena<T>, idx: u32) {
        let pos = (arena[idx].hcode() & self.mask) as usize;
        let head = self.buckets[pos];
        arena[idx].set_hnext(head);
        self.buckets[pos] = idx;
        self.size += 1;
    }

    fn lookup<T: HashNode, F: Fn(&T) -> bool>(
        &self,
        arena: &Arena<T>,
        hcode: u64,
        eq: &F,
    ) -> Option<u32> {
        if self.buckets.is_empty() {
            return None;
        }
        let pos = (hcode & self.mask) as usize;
        let mut cur = self.buckets[pos];
        while cur != NIL {
            let node = &arena[cur];
            if node.hcode() == hcode && eq(node) {
                return Some(cur);
            }
            cur = node.hnext();
        }
        None
    }

    // Splice a matching node out of its chain; the element itself stays in
    // the arena, ownership returns to the caller.
    fn detach<T: HashNode, F: Fn(&T) -> bool>(
        &mut self,
        arena: &mut Arena<T>,
        hcode: u64,
        eq: &F,
    ) -> Option<u32> {
        if self.buckets.is_empty() {
            return None;
        }
        let pos = (hcode & self.mask) as usize;
        let mut prev = NIL;
        let mut cur = self.buckets[pos];
        while cur != NIL {
            let next = arena[cur].hnext();
            if arena[cur].hcode() == hcode && eq(&arena[cur]) {
                if prev == NIL {
                    self.buckets[pos] = next;
                } else {
                    arena[prev].set_hnext(next);
                }
                arena[cur].set_hnext(NIL);
                self.size -= 1;
                return Some(cur);
            }
            prev = cur;
            cur = next;
        }
        None
    }
}

/// Two-table hash map. Growth swaps `newer` into `older` and migrates a
/// bounded number of nodes on every subsequent operation, so no single
/// request pays for a full rehash.
#[derive(Debug)]
struct HMap {
    newer: HTab,
    older: HTab,
    migrate_pos: usize,
}

impl HMap {
    fn new() -> Self {
        Self {
            newer: HTab::unused(),
            older: HTab::unused(),
            migrate_pos: 0,
        }
    }

    fn lookup<T: HashNode, F: Fn(&T) -> bool>(
        &mut self,
        arena: &mut Arena<T>,
        hcode: u64,
        eq: F,
    ) -> Option<u32> {
        self.help_rehashing(&mut *arena);
        if let Some(idx) = self.newer.lookup(arena, hcode, &eq) {
            return Some(idx);
        }
        self.older.lookup(arena, hcode, &eq)
    }

    fn insert<T: HashNode>(&mut self, arena: &mut Arena<T>, idx: u32) {
        if self.newer.is_unused() {
            self.newer = HTab::new(4);
        }
        self.newer.insert(arena, idx);
        if self.older.is_unused() {
            let threshold = (self.newer.mask as usize + 1) * K_MAX_LOAD_FACTOR;
            if self.newer.size >= threshold {
                self.trigger_rehashing();
            }
        }
        self.help_rehashing(arena);
    }

    fn delete<T: HashNode, F: Fn(&T) -> bool>(
        &mut self,
        arena: &mut Arena<T>,
        hcode: u64,
        eq: F,
    ) -> Option<u32> {
        self.help_rehashing(&mut *arena);
        if let Some(idx) = self.newer.detach(&mut *arena, hcode, &eq) {
            return Some(idx);
        }
        self.older.detach(arena, hcode, &eq)
    }

    fn size(&self) -> usize {
        self.newer.size + self.older.size
    }

    #[allow(dead_code)]
    fn clear(&mut self) {
        *self = HMap::new();
    }

    fn trigger_rehashing(&mut self) {
        let cap = (self.newer.mask as usize + 1) * 2;
        self.older = std::mem::replace(&mut self.newer, HTab::new(cap));
        self.migrate_pos = 0;
    }

    // Move up to K_REHASHING_WORK nodes from `older` to `newer`.
    fn help_rehashing<T: HashNode>(&mut self, arena: &mut Arena<T>) {
        if self.older.is_unused() {
            return;
        }
        let mut nwork = 0;
        while nwork < K_REHASHING_WORK && self.older.size > 0 {
            if self.migrate_pos >= self.older.buckets.len() {
                break;
            }
            let head = self.older.buckets[self.migrate_pos];
            if head == NIL {
                self.migrate_pos += 1;
                continue;
            }
            self.older.buckets[self.migrate_pos] = arena[head].hnext();
            self.older.size -= 1;
            arena[head].set_hnext(NIL);
            self.newer.insert(arena, head);
            nwork += 1;
        }
        if self.older.size == 0 {
            self.older = HTab::unused();
            self.migrate_pos = 0;
        }
    }

    fn for_each<T: HashNode, F: FnMut(u32)>(&self, arena: &Arena<T>, mut f: F) {
        for tab in [&self.newer, &self.older] {
            for &head in &tab.buckets {
                let mut cur = head;
                while cur != NIL {
                    f(cur);
                    cur = arena[cur].hnext();
                }
            }
        }
    }
}

/* Sorted set */

// Member of a sorted set: hash-chained by name, AVL-linked by (score, name).
#[derive(Debug)]
struct ZNode {
    hcode: u64,
    hnext: u32,

    parent: u32,
    left: u32,
    right: u32,
    height: u32,
    count: u32, // subtree size, self included

    score: f64,
    name: Vec<u8>,
}

impl HashNode for ZNode {
    fn hcode(&self) -> u64 {
        self.hcode
    }

    fn hnext(&self) -> u32 {
        self.hnext
    }

    fn set_hnext(&mut self, next: u32) {
        self.hnext = next;
    }
}

fn znode_less(nodes: &Arena<ZNode>, a: u32, b: u32) -> bool {
    let (x, y) = (&nodes[a], &nodes[b]);
    (OrderedFloat(x.score), x.name.as_slice()) < (OrderedFloat(y.score), y.name.as_slice())
}

fn znode_height(nodes: &Arena<ZNode>, idx: u32) -> u32 {
    if idx == NIL {
        0
    } else {
        nodes[idx].height
    }
}

fn znode_count(nodes: &Arena<ZNode>, idx: u32) -> u32 {
    if idx == NIL {
        0
    } else {
        nodes[idx].count
    }
}

fn znode_update(nodes: &mut Arena<ZNode>, idx: u32) {
    let lh = znode_height(nodes, nodes[idx].left);
    let rh = znode_height(nodes, nodes[idx].right);
    let lc = znode_count(nodes, nodes[idx].left);
    let rc = znode_count(nodes, nodes[idx].right);
    let node = &mut nodes[idx];
    node.height = 1 + lh.max(rh);
    node.count = 1 + lc + rc;
}

// Rotations relink the parent's child pointer as well, so callers only need
// the returned subtree root.
fn znode_rot_left(nodes: &mut Arena<ZNode>, idx: u32) -> u32 {
    let parent = nodes[idx].parent;
    let pivot = nodes[idx].right;
    let inner = nodes[pivot].left;

    nodes[idx].right = inner;
    if inner != NIL {
        nodes[inner].parent = idx;
    }
    nodes[pivot].parent = parent;
    if parent != NIL {
        if nodes[parent].left == idx {
            nodes[parent].left = pivot;
        } else {
            nodes[parent].right = pivot;
        }
    }
    nodes[pivot].left = idx;
    nodes[idx].parent = pivot;

    znode_update(nodes, idx);
    znode_update(nodes, pivot);
    pivot
}

fn znode_rot_right(nodes: &mut Arena<ZNode>, idx: u32) -> u32 {
    let parent = nodes[idx].parent;
    let pivot = nodes[idx].left;
    let inner = nodes[pivot].right;

    nodes[idx].left = inner;
    if inner != NIL {
        nodes[inner].parent = idx;
    }
    nodes[pivot].parent = parent;
    if parent != NIL {
        if nodes[parent].left == idx {
            nodes[parent].left = pivot;
        } else {
            nodes[parent].right = pivot;
        }
    }
    nodes[pivot].right = idx;
    nodes[idx].parent = pivot;

    znode_update(nodes, idx);
    znode_update(nodes, pivot);
    pivot
}

fn znode_fix_left(nodes: &mut Arena<ZNode>, idx: u32) -> u32 {
    let left = nodes[idx].left;
    if znode_height(nodes, nodes[left].left) < znode_height(nodes, nodes[left].right) {
        znode_rot_left(nodes, left);
    }
    znode_rot_right(nodes, idx)
}

fn znode_fix_right(nodes: &mut Arena<ZNode>, idx: u32) -> u32 {
    let right = nodes[idx].right;
    if znode_height(nodes, nodes[right].right) < znode_height(nodes, nodes[right].left) {
        znode_rot_right(nodes, right);
    }
    znode_rot_left(nodes, idx)
}

// Restore height/count and balance from `idx` up to the root; returns the root.
fn znode_fix(nodes: &mut Arena<ZNode>, mut idx: u32) -> u32 {
    loop {
        znode_update(nodes, idx);
        let lh = znode_height(nodes, nodes[idx].left);
        let rh = znode_height(nodes, nodes[idx].right);
        let mut fixed = idx;
        if lh == rh + 2 {
            fixed = znode_fix_left(nodes, idx);
        } else if lh + 2 == rh {
            fixed = znode_fix_right(nodes, idx);
        }
        let parent = nodes[fixed].parent;
        if parent == NIL {
            return fixed;
        }
        idx = parent;
    }
}

// Delete a node with at most one child; returns the new tree root.
fn znode_del_easy(nodes: &mut Arena<ZNode>, idx: u32) -> u32 {
    debug_assert!(nodes[idx].left == NIL || nodes[idx].right == NIL);
    let child = if nodes[idx].left != NIL {
        nodes[idx].left
    } else {
        nodes[idx].right
    };
    let parent = nodes[idx].parent;
    if child != NIL {
        nodes[child].parent = parent;
    }
    if parent == NIL {
        return child;
    }
    if nodes[parent].left == idx {
        nodes[parent].left = child;
    } else {
        nodes[parent].right = child;
    }
    znode_fix(nodes, parent)
}

// Full AVL delete. An internal node is replaced by its in-order successor via
// link transplant, never by copying payloads, so indices held by the hash
// index stay valid.
fn znode_del(nodes: &mut Arena<ZNode>, idx: u32) -> u32 {
    if nodes[idx].left == NIL || nodes[idx].right == NIL {
        return znode_del_easy(nodes, idx);
    }
    let mut victim = nodes[idx].right;
    while nodes[victim].left != NIL {
        victim = nodes[victim].left;
    }
    let mut root = znode_del_easy(nodes, victim);

    let (l, r, p, h, c) = {
        let node = &nodes[idx];
        (node.left, node.right, node.parent, node.height, node.count)
    };
    {
        let v = &mut nodes[victim];
        v.left = l;
        v.right = r;
        v.parent = p;
        v.height = h;
        v.count = c;
    }
    if l != NIL {
        nodes[l].parent = victim;
    }
    if r != NIL {
        nodes[r].parent = victim;
    }
    if p == NIL {
        root = victim;
    } else if nodes[p].left == idx {
        nodes[p].left = victim;
    } else {
        nodes[p].right = victim;
    }
    root
}

// Walk to the node `offset` ranks away, counting with subtree sizes.
fn znode_offset(nodes: &Arena<ZNode>, start: u32, offset: i64) -> Option<u32> {
    let mut node = start;
    let mut pos = 0i64; // rank relative to the starting node
    while pos != offset {
        let right_count = znode_count(nodes, nodes[node].right) as i64;
        let left_count = znode_count(nodes, nodes[node].left) as i64;
        if pos < offset && pos + right_count >= offset {
            // target is inside the right subtree
            node = nodes[node].right;
            pos += znode_count(nodes, nodes[node].left) as i64 + 1;
        } else if pos > offset && pos - left_count <= offset {
            // target is inside the left subtree
            node = nodes[node].left;
            pos -= znode_count(nodes, nodes[node].right) as i64 + 1;
        } else {
            let parent = nodes[node].parent;
            if parent == NIL {
                return None; // out of range
            }
            if nodes[parent].right == node {
                pos -= left_count + 1;
            } else {
                pos += right_count + 1;
            }
            node = parent;
        }
    }
    Some(node)
}

/// Sorted set: one arena of members indexed both by a hash map (name) and an
/// order-statistic AVL tree (score, name).
#[derive(Debug)]
struct ZSet {
    nodes: Arena<ZNode>,
    index: HMap,
    root: u32,
}

impl ZSet {
    fn new() -> Self {
        Self {
            nodes: Arena::new(),
            index: HMap::new(),
            root: NIL,
        }
    }

    fn len(&self) -> usize {
        self.index.size()
    }

    fn lookup(&mut self, name: &[u8]) -> Option<u32> {
        let hcode = hash_std(name);
        self.index.lookup(&mut self.nodes, hcode, |n| n.name == name)
    }

    // Returns true iff a new member was created.
    fn insert(&mut self, name: &[u8], score: f64) -> bool {
        if let Some(idx) = self.lookup(name) {
            if self.nodes[idx].score != score {
                self.update_score(idx, score);
            }
            return false;
        }
        let idx = self.nodes.alloc(ZNode {
            hcode: hash_std(name),
            hnext: NIL,
            parent: NIL,
            left: NIL,
            right: NIL,
            height: 1,
            count: 1,
            score,
            name: name.to_vec(),
        });
        self.index.insert(&mut self.nodes, idx);
        self.tree_insert(idx);
        true
    }

    // Detach, rescore, reinsert: the tree position depends on the score.
    fn update_score(&mut self, idx: u32, score: f64) {
        self.root = znode_del(&mut self.nodes, idx);
        let node = &mut self.nodes[idx];
        node.parent = NIL;
        node.left = NIL;
        node.right = NIL;
        node.height = 1;
        node.count = 1;
        node.score = score;
        self.tree_insert(idx);
    }

    fn tree_insert(&mut self, idx: u32) {
        let mut cur = self.root;
        let mut parent = NIL;
        let mut is_left = false;
        while cur != NIL {
            parent = cur;
            is_left = znode_less(&self.nodes, idx, cur);
            cur = if is_left {
                self.nodes[cur].left
            } else {
                self.nodes[cur].right
            };
        }
        self.nodes[idx].parent = parent;
        if parent == NIL {
            self.root = idx;
            return;
        }
        if is_left {
            self.nodes[parent].left = idx;
        } else {
            self.nodes[parent].right = idx;
        }
        self.root = znode_fix(&mut self.nodes, idx);
    }

    fn delete(&mut self, idx: u32) {
        let hcode = self.nodes[idx].hcode;
        let name = self.nodes[idx].name.clone();
        let detached = self.index.delete(&mut self.nodes, hcode, |n| n.name == name);
        debug_assert_eq!(detached, Some(idx));
        self.root = znode_del(&mut self.nodes, idx);
        self.nodes.free(idx);
    }

    // First node with (score, name) >= the query key, in tree order.
    fn seek_ge(&self, score: f64, name: &[u8]) -> Option<u32> {
        let mut cur = self.root;
        let mut best = None;
        while cur != NIL {
            let node = &self.nodes[cur];
            if (OrderedFloat(node.score), node.name.as_slice()) < (OrderedFloat(score), name) {
                cur = node.right;
            } else {
                best = Some(cur);
                cur = node.left;
            }
        }
        best
    }
}

/* TTL heap */

#[derive(Debug, Clone, Copy)]
struct HeapItem {
    deadline: u64, // absolute monotonic ms
    entry: u32,
}

fn heap_left(i: usize) -> usize {
    i * 2 + 1
}

fn heap_right(i: usize) -> usize {
    i * 2 + 2
}

fn heap_parent(i: usize) -> usize {
    (i - 1) / 2
}

// Every slot movement below writes the owner's back-index; a missed update
// leaves a dangling heap_idx and corrupts later removals.
fn heap_up(heap: &mut [HeapItem], entries: &mut Arena<Entry>, mut pos: usize) {
    let item = heap[pos];
    while pos > 0 && heap[heap_parent(pos)].deadline > item.deadline {
        heap[pos] = heap[heap_parent(pos)];
        entries[heap[pos].entry].heap_idx = pos as u32;
        pos = heap_parent(pos);
    }
    heap[pos] = item;
    entries[item.entry].heap_idx = pos as u32;
}

fn heap_down(heap: &mut [HeapItem], entries: &mut Arena<Entry>, mut pos: usize) {
    let item = heap[pos];
    let len = heap.len();
    loop {
        let left = heap_left(pos);
        let right = heap_right(pos);
        let mut min_pos = pos;
        let mut min_val = item.deadline;
        if left < len && heap[left].deadline < min_val {
            min_pos = left;
            min_val = heap[left].deadline;
        }
        if right < len && heap[right].deadline < min_val {
            min_pos = right;
        }
        if min_pos == pos {
            break;
        }
        heap[pos] = heap[min_pos];
        entries[heap[pos].entry].heap_idx = pos as u32;
        pos = min_pos;
    }
    heap[pos] = item;
    entries[item.entry].heap_idx = pos as u32;
}

fn heap_update(heap: &mut [HeapItem], entries: &mut Arena<Entry>, pos: usize) {
    if pos > 0 && heap[heap_parent(pos)].deadline > heap[pos].deadline {
        heap_up(heap, entries, pos);
    } else {
        heap_down(heap, entries, pos);
    }
}

fn heap_upsert(heap: &mut Vec<HeapItem>, entries: &mut Arena<Entry>, entry: u32, deadline: u64) {
    let pos = entries[entry].heap_idx;
    if pos != NIL {
        let pos = pos as usize;
        heap[pos].deadline = deadline;
        heap_update(heap, entries, pos);
    } else {
        heap.push(HeapItem { deadline, entry });
        let pos = heap.len() - 1;
        entries[entry].heap_idx = pos as u32;
        heap_up(heap, entries, pos);
    }
}

fn heap_delete(heap: &mut Vec<HeapItem>, entries: &mut Arena<Entry>, pos: usize) {
    entries[heap[pos].entry].heap_idx = NIL;
    let last = heap.pop().expect("heap_delete on empty heap");
    if pos < heap.len() {
        heap[pos] = last;
        entries[last.entry].heap_idx = pos as u32;
        heap_update(heap, entries, pos);
    }
}

/* Thread pool */

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    shutdown: bool,
}

// Fixed worker set draining a FIFO. Jobs own everything they touch; workers
// never reach back into the keyspace.
pub struct ThreadPool {
    workers: Vec<thread::JoinHandle<()>>,
    state: Arc<(Mutex<PoolState>, Condvar)>,
}

impl ThreadPool {
    fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0);
        let state = Arc::new((
            Mutex::new(PoolState {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            Condvar::new(),
        ));
        let workers = (0..num_threads)
            .map(|_| {
                let state = Arc::clone(&state);
                thread::spawn(move || worker_loop(&state))
            })
            .collect();
        Self { workers, state }
    }

    fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let (lock, cvar) = &*self.state;
        lock.lock().unwrap().queue.push_back(Box::new(job));
        cvar.notify_one();
    }
}

impl Drop for ThreadPool {
    // Workers drain the remaining queue before exiting.
    fn drop(&mut self) {
        let (lock, cvar) = &*self.state;
        lock.lock().unwrap().shutdown = true;
        cvar.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(state: &(Mutex<PoolState>, Condvar)) {
    let (lock, cvar) = state;
    loop {
        let job = {
            let mut st = lock.lock().unwrap();
            loop {
                if let Some(job) = st.queue.pop_front() {
                    break job;
                }
                if st.shutdown {
                    return;
                }
                st = cvar.wait(st).unwrap();
            }
        };
        job();
    }
}

/* Timer */
fn get_monotonic_time_ms() -> u64 {
    // a static start time to measure elapsed time against
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/* Keyspace */

#[derive(Debug)]
enum Value {
    Str(Vec<u8>),
    ZSet(ZSet),
}

#[derive(Debug)]
struct Entry {
    key: Vec<u8>,
    hcode: u64,
    hnext: u32,
    value: Value,
    heap_idx: u32, // NIL when the entry carries no TTL
}

impl Entry {
    fn new(key: Vec<u8>, value: Value) -> Self {
        let hcode = hash_std(&key);
        Self {
            key,
            hcode,
            hnext: NIL,
            value,
            heap_idx: NIL,
        }
    }
}

impl HashNode for Entry {
    fn hcode(&self) -> u64 {
        self.hcode
    }

    fn hnext(&self) -> u32 {
        self.hnext
    }

    fn set_hnext(&mut self, next: u32) {
        self.hnext = next;
    }
}

struct Server {
    entries: Arena<Entry>,
    db: HMap,
    heap: Vec<HeapItem>,
    pool: ThreadPool,
}

impl Server {
    fn new() -> Self {
        Self {
            entries: Arena::new(),
            db: HMap::new(),
            heap: Vec::new(),
            pool: ThreadPool::new(K_NUM_WORKERS),
        }
    }

    // Lookup that treats an expired-but-unreaped entry as absent (and reaps it).
    fn lookup_live(&mut self, key: &[u8]) -> Option<u32> {
        let hcode = hash_std(key);
        let idx = self.db.lookup(&mut self.entries, hcode, |e| e.key == key)?;
        let hpos = self.entries[idx].heap_idx;
        if hpos != NIL && self.heap[hpos as usize].deadline <= get_monotonic_time_ms() {
            self.del_key(key);
            return None;
        }
        Some(idx)
    }

    fn del_key(&mut self, key: &[u8]) -> bool {
        let hcode = hash_std(key);
        let Some(idx) = self.db.delete(&mut self.entries, hcode, |e| e.key == key) else {
            return false;
        };
        let hpos = self.entries[idx].heap_idx;
        if hpos != NIL {
            heap_delete(&mut self.heap, &mut self.entries, hpos as usize);
        }
        let entry = self.entries.free(idx);
        self.dispose(entry);
        true
    }

    // Large payloads are freed on the pool; the subgraph is already unlinked
    // from every shared structure, so the job owns it outright.
    fn dispose(&self, entry: Entry) {
        let big = matches!(&entry.value, Value::ZSet(z) if z.len() > K_LARGE_CONTAINER_SIZE);
        if big {
            debug!(
                key = %String::from_utf8_lossy(&entry.key),
                "offloading large value free"
            );
            self.pool.submit(move || drop(entry));
        }
    }

    fn set_ttl(&mut self, idx: u32, ttl_ms: i64) {
        if ttl_ms < 0 {
            let hpos = self.entries[idx].heap_idx;
            if hpos != NIL {
                heap_delete(&mut self.heap, &mut self.entries, hpos as usize);
            }
        } else {
            let deadline = get_monotonic_time_ms() + ttl_ms as u64;
            heap_upsert(&mut self.heap, &mut self.entries, idx, deadline);
        }
    }
}

/* Response serialization */

fn out_ok(out: &mut Buffer) {
    out.append_u32(RES_OK);
}

fn out_err(out: &mut Buffer, msg: &str) {
    out.append_u32(RES_ERR);
    out.append(msg.as_bytes());
}

fn out_nx(out: &mut Buffer) {
    out.append_u32(RES_NX);
}

fn out_str(out: &mut Buffer, s: &[u8]) {
    out.append_u32(s.len() as u32);
    out.append(s);
}

/* Commands */

fn parse_i64(data: &[u8]) -> Option<i64> {
    std::str::from_utf8(data).ok()?.parse().ok()
}

fn parse_f64(data: &[u8]) -> Option<f64> {
    let v: f64 = std::str::from_utf8(data).ok()?.parse().ok()?;
    (!v.is_nan()).then_some(v)
}

// `*` matches any run of bytes, `?` matches exactly one byte.
fn glob_match(pat: &[u8], s: &[u8]) -> bool {
    let (mut p, mut i) = (0usize, 0usize);
    let mut star = usize::MAX; // position of the last `*` seen
    let mut mark = 0usize;
    while i < s.len() {
        if p < pat.len() && (pat[p] == b'?' || pat[p] == s[i]) {
            p += 1;
            i += 1;
        } else if p < pat.len() && pat[p] == b'*' {
            star = p;
            mark = i;
            p += 1;
        } else if star != usize::MAX {
            // widen what the last `*` swallowed and retry
            p = star + 1;
            mark += 1;
            i = mark;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == b'*' {
        p += 1;
    }
    p == pat.len()
}

fn do_get(srv: &mut Server, cmd: &[Vec<u8>], out: &mut Buffer) {
    match srv.lookup_live(&cmd[1]) {
        None => out_nx(out),
        Some(idx) => match &srv.entries[idx].value {
            Value::Str(val) => {
                out_ok(out);
                out.append(val);
            }
            Value::ZSet(_) => out_err(out, "not a string"),
        },
    }
}

fn do_set(srv: &mut Server, cmd: &[Vec<u8>], out: &mut Buffer) {
    match srv.lookup_live(&cmd[1]) {
        Some(idx) => match &mut srv.entries[idx].value {
            Value::Str(val) => {
                *val = cmd[2].clone();
                out_ok(out);
            }
            Value::ZSet(_) => out_err(out, "not a string"),
        },
        None => {
            let idx = srv
                .entries
                .alloc(Entry::new(cmd[1].clone(), Value::Str(cmd[2].clone())));
            srv.db.insert(&mut srv.entries, idx);
            out_ok(out);
        }
    }
}

fn do_del(srv: &mut Server, cmd: &[Vec<u8>], out: &mut Buffer) {
    srv.del_key(&cmd[1]);
    out_ok(out);
}

fn do_pexpire(srv: &mut Server, cmd: &[Vec<u8>], out: &mut Buffer) {
    let Some(ttl_ms) = parse_i64(&cmd[2]) else {
        return out_err(out, "expect int64");
    };
    match srv.lookup_live(&cmd[1]) {
        None => out_nx(out),
        Some(idx) => {
            srv.set_ttl(idx, ttl_ms);
            out_ok(out);
        }
    }
}

fn do_pttl(srv: &mut Server, cmd: &[Vec<u8>], out: &mut Buffer) {
    match srv.lookup_live(&cmd[1]) {
        None => out_nx(out),
        Some(idx) => {
            out_ok(out);
            let hpos = srv.entries[idx].heap_idx;
            if hpos == NIL {
                out.append_i64(-1);
            } else {
                let deadline = srv.heap[hpos as usize].deadline;
                let now = get_monotonic_time_ms();
                out.append_i64(deadline.saturating_sub(now) as i64);
            }
        }
    }
}

fn do_keys(srv: &mut Server, cmd: &[Vec<u8>], out: &mut Buffer) {
    let pat = &cmd[1];
    let now = get_monotonic_time_ms();
    out_ok(out);
    let ctx = out.arr_begin();
    let mut n = 0u32;
    let entries = &srv.entries;
    let heap = &srv.heap;
    srv.db.for_each(entries, |idx| {
        let entry = &entries[idx];
        if entry.heap_idx != NIL && heap[entry.heap_idx as usize].deadline <= now {
            return; // expired, not yet reaped
        }
        if glob_match(pat, &entry.key) {
            out_str(out, &entry.key);
            n += 1;
        }
    });
    out.arr_end(ctx, n);
}

fn do_zadd(srv: &mut Server, cmd: &[Vec<u8>], out: &mut Buffer) {
    let Some(score) = parse_f64(&cmd[2]) else {
        return out_err(out, "expect fp number");
    };
    match srv.lookup_live(&cmd[1]) {
        Some(idx) => match &mut srv.entries[idx].value {
            Value::ZSet(zset) => {
                let added = zset.insert(&cmd[3], score);
                out_ok(out);
                out.append_i64(added as i64);
            }
            Value::Str(_) => out_err(out, "expect zset"),
        },
        None => {
            let mut zset = ZSet::new();
            zset.insert(&cmd[3], score);
            let idx = srv
                .entries
                .alloc(Entry::new(cmd[1].clone(), Value::ZSet(zset)));
            srv.db.insert(&mut srv.entries, idx);
            out_ok(out);
            out.append_i64(1);
        }
    }
}

fn do_zrem(srv: &mut Server, cmd: &[Vec<u8>], out: &mut Buffer) {
    match srv.lookup_live(&cmd[1]) {
        None => out_ok(out),
        Some(idx) => match &mut srv.entries[idx].value {
            Value::ZSet(zset) => {
                if let Some(node) = zset.lookup(&cmd[2]) {
                    zset.delete(node);
                }
                out_ok(out);
            }
            Value::Str(_) => out_err(out, "expect zset"),
        },
    }
}

fn do_zscore(srv: &mut Server, cmd: &[Vec<u8>], out: &mut Buffer) {
    match srv.lookup_live(&cmd[1]) {
        None => out_nx(out),
        Some(idx) => match &mut srv.entries[idx].value {
            Value::ZSet(zset) => match zset.lookup(&cmd[2]) {
                Some(node) => {
                    let score = zset.nodes[node].score;
                    out_ok(out);
                    out.append_f64(score);
                }
                None => out_nx(out),
            },
            Value::Str(_) => out_err(out, "expect zset"),
        },
    }
}

fn do_zquery(srv: &mut Server, cmd: &[Vec<u8>], out: &mut Buffer) {
    let Some(score) = parse_f64(&cmd[2]) else {
        return out_err(out, "expect fp number");
    };
    let name = &cmd[3];
    let Some(offset) = parse_i64(&cmd[4]) else {
        return out_err(out, "expect int64");
    };
    let Some(limit) = parse_i64(&cmd[5]) else {
        return out_err(out, "expect int64");
    };
    match srv.lookup_live(&cmd[1]) {
        None => {
            // an absent key reads as an empty set
            out_ok(out);
            let ctx = out.arr_begin();
            out.arr_end(ctx, 0);
        }
        Some(idx) => match &srv.entries[idx].value {
            Value::ZSet(zset) => {
                out_ok(out);
                let ctx = out.arr_begin();
                if limit <= 0 {
                    out.arr_end(ctx, 0);
                    return;
                }
                let mut node = zset.seek_ge(score, name);
                if let Some(start) = node {
                    node = znode_offset(&zset.nodes, start, offset);
                }
                let mut n = 0u32;
                while let Some(cur) = node {
                    if (n as i64) >= limit {
                        break;
                    }
                    let znode = &zset.nodes[cur];
                    out.append_f64(znode.score);
                    out_str(out, &znode.name);
                    n += 1;
                    node = znode_offset(&zset.nodes, cur, 1);
                }
                out.arr_end(ctx, n);
            }
            Value::Str(_) => out_err(out, "expect zset"),
        },
    }
}

// argv[0] is case-sensitive lower-case; arity per the command table.
fn do_request(srv: &mut Server, cmd: &[Vec<u8>], out: &mut Buffer) {
    match cmd.first().map(|name| name.as_slice()) {
        Some(b"get") if cmd.len() == 2 => do_get(srv, cmd, out),
        Some(b"set") if cmd.len() == 3 => do_set(srv, cmd, out),
        Some(b"del") if cmd.len() == 2 => do_del(srv, cmd, out),
        Some(b"pexpire") if cmd.len() == 3 => do_pexpire(srv, cmd, out),
        Some(b"pttl") if cmd.len() == 2 => do_pttl(srv, cmd, out),
        Some(b"keys") if cmd.len() == 2 => do_keys(srv, cmd, out),
        Some(b"zadd") if cmd.len() == 4 => do_zadd(srv, cmd, out),
        Some(b"zrem") if cmd.len() == 3 => do_zrem(srv, cmd, out),
        Some(b"zscore") if cmd.len() == 3 => do_zscore(srv, cmd, out),
        Some(b"zquery") if cmd.len() == 6 => do_zquery(srv, cmd, out),
        _ => out_err(out, "unknown command"),
    }
}

/* Request framing */

#[derive(Debug, Error)]
enum ProtoError {
    #[error("argument count over limit")]
    TooManyArgs,
    #[error("truncated argument list")]
    Truncated,
    #[error("trailing bytes after arguments")]
    TrailingBytes,
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Option<u32> {
    let bytes = buf.get(*pos..*pos + 4)?;
    *pos += 4;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

// Payload layout: nstr:u32, then nstr x (slen:u32 | bytes).
fn parse_args(payload: &[u8]) -> Result<Vec<Vec<u8>>, ProtoError> {
    let mut pos = 0usize;
    let nstr = read_u32(payload, &mut pos).ok_or(ProtoError::Truncated)? as usize;
    if nstr > K_MAX_ARGS {
        return Err(ProtoError::TooManyArgs);
    }
    let mut cmd = Vec::new();
    for _ in 0..nstr {
        let slen = read_u32(payload, &mut pos).ok_or(ProtoError::Truncated)? as usize;
        let arg = payload.get(pos..pos + slen).ok_or(ProtoError::Truncated)?;
        cmd.push(arg.to_vec());
        pos += slen;
    }
    if pos != payload.len() {
        return Err(ProtoError::TrailingBytes);
    }
    Ok(cmd)
}

// Drain every complete frame already buffered (pipelining).
// Returns false when the connection must be closed.
fn try_parse_requests(srv: &mut Server, incoming: &mut Buffer, outgoing: &mut Buffer) -> bool {
    loop {
        if incoming.len() < 4 {
            return true; // want more bytes
        }
        let len_bytes: [u8; 4] = incoming[..4].try_into().unwrap();
        let msg_len = u32::from_le_bytes(len_bytes) as usize;
        if msg_len > K_MAX_MSG {
            debug!(len = msg_len, "oversized request frame");
            return false;
        }
        if incoming.len() < 4 + msg_len {
            return true;
        }
        let cmd = match parse_args(&incoming[4..4 + msg_len]) {
            Ok(cmd) => cmd,
            Err(err) => {
                debug!("malformed request: {err}");
                return false;
            }
        };
        incoming.consume(4 + msg_len);

        let header_pos = outgoing.response_begin();
        do_request(srv, &cmd, outgoing);
        outgoing.response_end(header_pos);
    }
}

/* Connection state */

#[derive(Debug)]
struct Conn {
    socket: Socket,

    // application intent, consumed by the event loop
    want_read: bool,
    want_write: bool,
    want_close: bool,

    // buffered input and output
    incoming: Buffer,
    outgoing: Buffer,
}

impl Conn {
    fn new(socket: Socket) -> Self {
        Self {
            socket,
            want_read: true,
            want_write: false,
            want_close: false,
            incoming: Buffer::new(),
            outgoing: Buffer::new(),
        }
    }
}

fn events_from_conn(conn: &Conn) -> PollFlags {
    let mut events = PollFlags::POLLERR;
    if conn.want_read {
        events |= PollFlags::POLLIN;
    }
    if conn.want_write {
        events |= PollFlags::POLLOUT;
    }
    events
}

fn handle_read(conn: &mut Conn, srv: &mut Server) {
    let mut buf = [0u8; K_READ_CHUNK];
    match conn.socket.read(&mut buf) {
        Ok(0) => {
            // EOF: client closed its end
            conn.want_close = true;
            return;
        }
        Ok(n) => conn.incoming.append(&buf[..n]),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => return,
        Err(e) => {
            debug!("read error: {e}");
            conn.want_close = true;
            return;
        }
    }

    if !try_parse_requests(srv, &mut conn.incoming, &mut conn.outgoing) {
        conn.want_close = true;
        return;
    }

    if !conn.outgoing.is_empty() {
        conn.want_read = false;
        conn.want_write = true;
        // optimistic write to save one poll round-trip
        handle_write(conn);
    }
}

fn handle_write(conn: &mut Conn) {
    match conn.socket.write(&conn.outgoing) {
        Ok(0) => conn.want_close = true,
        Ok(n) => {
            conn.outgoing.consume(n);
            if conn.outgoing.is_empty() {
                conn.want_write = false;
                conn.want_read = true;
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
        Err(e) => {
            debug!("write error: {e}");
            conn.want_close = true;
        }
    }
}

fn handle_accept(listener: &Socket, fd2conn: &mut HashMap<RawFd, Conn>) {
    loop {
        match listener.accept() {
            Ok((socket, addr)) => {
                if let Err(e) = socket.set_nonblocking(true) {
                    warn!("set_nonblocking on accepted socket: {e}");
                    continue;
                }
                let fd = socket.as_raw_fd();
                debug!(fd, client = ?addr.as_socket(), "client connected");
                fd2conn.insert(fd, Conn::new(socket));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                // transient accept failures must not kill the listener
                warn!("accept error: {e}");
                break;
            }
        }
    }
}

/* TTL expiration driver */

fn next_timer_ms(srv: &Server) -> PollTimeout {
    match srv.heap.first() {
        None => PollTimeout::NONE,
        Some(top) => {
            let now = get_monotonic_time_ms();
            let wait = top.deadline.saturating_sub(now).min(K_MAX_TIMER_WAIT_MS);
            PollTimeout::from(wait as u16)
        }
    }
}

// Reap expired entries, capped per tick to stay fair to network traffic.
fn process_timers(srv: &mut Server) {
    let now = get_monotonic_time_ms();
    let mut nworks = 0;
    while let Some(&top) = srv.heap.first() {
        if top.deadline > now || nworks >= K_MAX_WORKS {
            break;
        }
        let key = srv.entries[top.entry].key.clone();
        debug!(key = %String::from_utf8_lossy(&key), "ttl expired");
        srv.del_key(&key);
        nworks += 1;
    }
}

/* Event loop */

fn run_server(port: u16) -> io::Result<()> {
    let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    listener.set_reuse_address(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    listener.bind(&SockAddr::from(addr))?;
    listener.set_nonblocking(true)?;
    listener.listen(nix::libc::SOMAXCONN)?;
    info!(%addr, "server listening");

    let mut srv = Server::new();
    let mut fd2conn: HashMap<RawFd, Conn> = HashMap::new();

    loop {
        let mut poll_fds = Vec::with_capacity(fd2conn.len() + 1);
        poll_fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        for conn in fd2conn.values() {
            poll_fds.push(PollFd::new(conn.socket.as_fd(), events_from_conn(conn)));
        }

        match poll(&mut poll_fds, next_timer_ms(&srv)) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }

        let ready: Vec<(RawFd, PollFlags)> = poll_fds
            .iter()
            .map(|p| (p.as_fd().as_raw_fd(), p.revents().unwrap_or(PollFlags::empty())))
            .collect();
        drop(poll_fds);

        let listen_fd = listener.as_raw_fd();
        for (fd, revents) in ready {
            if revents.is_empty() {
                continue;
            }
            if fd == listen_fd {
                handle_accept(&listener, &mut fd2conn);
                continue;
            }
            let Some(conn) = fd2conn.get_mut(&fd) else {
                continue;
            };
            if revents.contains(PollFlags::POLLIN) && conn.want_read {
                handle_read(conn, &mut srv);
            }
            if revents.contains(PollFlags::POLLOUT) && conn.want_write && !conn.outgoing.is_empty()
            {
                handle_write(conn);
            }
            if conn.want_close || revents.contains(PollFlags::POLLERR) {
                debug!(fd, "closing connection");
                fd2conn.remove(&fd);
            }
        }

        process_timers(&mut srv);
    }
}

fn main() -> io::Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let mut port = K_DEFAULT_PORT;
    if let Some(arg) = env::args().nth(1) {
        match arg.parse() {
            Ok(p) => port = p,
            Err(_) => {
                error!("invalid port: {arg}");
                std::process::exit(1);
            }
        }
    }

    run_server(port)
}
