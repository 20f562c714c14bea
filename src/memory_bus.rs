use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use crate::device::DeviceKey;

pub const PAGE_BITS: u32 = 10;
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;
pub const PAGE_MASK: u32 = PAGE_SIZE as u32 - 1;

/// Shared byte store that pages of the bus may point into.
///
/// Several pages (and several devices) alias the same store, so bytes are
/// cells and the store is reference counted.
#[derive(Clone)]
pub struct Ram(Rc<[Cell<u8>]>);

impl Ram {
    pub fn new(len: usize) -> Self {
        Self::filled(len, 0)
    }

    pub fn filled(len: usize, value: u8) -> Self {
        Self((0..len).map(|_| Cell::new(value)).collect())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.iter().copied().map(Cell::new).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn read(&self, offset: usize) -> u8 {
        self.0.get(offset).map(Cell::get).unwrap_or(0xff)
    }

    pub fn write(&self, offset: usize, data: u8) {
        if let Some(cell) = self.0.get(offset) {
            cell.set(data);
        }
    }

    /// Copy `bytes` in at `offset`, clipped to the store.
    pub fn load(&self, offset: usize, bytes: &[u8]) {
        for (cell, b) in self.0.iter().skip(offset).zip(bytes) {
            cell.set(*b);
        }
    }

    pub fn fill(&self, value: u8) {
        for cell in self.0.iter() {
            cell.set(value);
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.iter().map(Cell::get).collect()
    }

    pub fn same_store(&self, other: &Ram) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Ram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ram({} bytes)", self.0.len())
    }
}

pub type ReadFn<D> = fn(&mut D, u32) -> u8;
pub type WriteFn<D> = fn(&mut D, u32, u8);

type ReadTrap = Rc<dyn Fn(u32) -> u8>;
type WriteTrap = Rc<dyn Fn(u32, u8)>;

/// What the read side of a page resolves to.
#[derive(Clone, Default)]
enum ReadTarget {
    #[default]
    Unmapped,
    Memory {
        ram: Ram,
        base: usize,
    },
    Func(ReadTrap),
}

#[derive(Clone, Default)]
enum WriteTarget {
    #[default]
    Unmapped,
    Memory {
        ram: Ram,
        base: usize,
    },
    Func(WriteTrap),
}

impl fmt::Debug for ReadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadTarget::Unmapped => write!(f, "-"),
            ReadTarget::Memory { base, .. } => write!(f, "M{:05X}", base),
            ReadTarget::Func(_) => write!(f, "F"),
        }
    }
}

impl fmt::Debug for WriteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteTarget::Unmapped => write!(f, "-"),
            WriteTarget::Memory { base, .. } => write!(f, "M{:05X}", base),
            WriteTarget::Func(_) => write!(f, "F"),
        }
    }
}

#[derive(Clone, Default, Debug)]
struct Page {
    read: ReadTarget,
    write: WriteTarget,
    wait: u32,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
struct Owner {
    read: Option<DeviceKey>,
    write: Option<DeviceKey>,
}

/// Which side of a page an operation touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Read,
    Write,
    Both,
}

impl Side {
    fn read(self) -> bool {
        matches!(self, Side::Read | Side::Both)
    }

    fn write(self) -> bool {
        matches!(self, Side::Write | Side::Both)
    }
}

/// Paged address space. Every 1 KiB page resolves independently to a byte
/// store, a device trap or nothing, per side.
///
/// The "2" setters only repoint a page whose recorded owner for that side is
/// the caller, so overlapping bank switches by different devices cannot undo
/// each other.
#[derive(Debug)]
pub struct MemoryBus {
    pages: RefCell<Vec<Page>>,
    owners: RefCell<Vec<Owner>>,
}

impl MemoryBus {
    pub fn new(npages: usize) -> Self {
        Self {
            pages: RefCell::new(vec![Page::default(); npages]),
            owners: RefCell::new(vec![Owner::default(); npages]),
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.borrow().len()
    }

    /// Address space size in bytes.
    pub fn size(&self) -> usize {
        self.page_count() << PAGE_BITS
    }

    /// Unmap every page, drop every owner and wait.
    pub fn reset(&self) {
        for page in self.pages.borrow_mut().iter_mut() {
            *page = Page::default();
        }
        for owner in self.owners.borrow_mut().iter_mut() {
            *owner = Owner::default();
        }
    }

    pub fn read8(&self, addr: u32) -> u8 {
        let target = {
            let pages = self.pages.borrow();
            debug_assert!(
                ((addr >> PAGE_BITS) as usize) < pages.len(),
                "memory read at {:#x} beyond {:#x}",
                addr,
                pages.len() << PAGE_BITS
            );
            match pages.get((addr >> PAGE_BITS) as usize) {
                Some(page) => page.read.clone(),
                None => return 0xff,
            }
        };
        match target {
            ReadTarget::Unmapped => 0xff,
            ReadTarget::Memory { ram, base } => ram.read(base + (addr & PAGE_MASK) as usize),
            ReadTarget::Func(trap) => trap(addr),
        }
    }

    pub fn write8(&self, addr: u32, data: u8) {
        let target = {
            let pages = self.pages.borrow();
            debug_assert!(
                ((addr >> PAGE_BITS) as usize) < pages.len(),
                "memory write at {:#x} beyond {:#x}",
                addr,
                pages.len() << PAGE_BITS
            );
            match pages.get((addr >> PAGE_BITS) as usize) {
                Some(page) => page.write.clone(),
                None => return,
            }
        };
        match target {
            WriteTarget::Unmapped => {}
            WriteTarget::Memory { ram, base } => {
                ram.write(base + (addr & PAGE_MASK) as usize, data)
            }
            WriteTarget::Func(trap) => trap(addr, data),
        }
    }

    /// Wait states charged for an access to the page holding `addr`.
    pub fn wait(&self, addr: u32) -> u32 {
        self.pages
            .borrow()
            .get((addr >> PAGE_BITS) as usize)
            .map(|p| p.wait)
            .unwrap_or(0)
    }

    pub fn set_wait(&self, addr: u32, wait: u32) {
        self.set_waits(addr, PAGE_SIZE as u32, wait);
    }

    pub fn set_waits(&self, addr: u32, len: u32, wait: u32) {
        self.for_pages(addr, len, |_, page, _| page.wait = wait);
    }

    // -- byte stores --

    /// Point the page holding `addr` at `ram[offset..]`.
    pub fn set_read_memory(&self, addr: u32, ram: &Ram, offset: usize) {
        self.set_memorys_on(Side::Read, addr, PAGE_SIZE as u32, ram, offset, None);
    }

    pub fn set_write_memory(&self, addr: u32, ram: &Ram, offset: usize) {
        self.set_memorys_on(Side::Write, addr, PAGE_SIZE as u32, ram, offset, None);
    }

    pub fn set_memory(&self, addr: u32, ram: &Ram, offset: usize) {
        self.set_memorys_on(Side::Both, addr, PAGE_SIZE as u32, ram, offset, None);
    }

    /// Map `len` bytes starting at `addr` onto consecutive bytes of `ram`.
    pub fn set_read_memorys(&self, addr: u32, len: u32, ram: &Ram, offset: usize) {
        self.set_memorys_on(Side::Read, addr, len, ram, offset, None);
    }

    pub fn set_write_memorys(&self, addr: u32, len: u32, ram: &Ram, offset: usize) {
        self.set_memorys_on(Side::Write, addr, len, ram, offset, None);
    }

    pub fn set_memorys(&self, addr: u32, len: u32, ram: &Ram, offset: usize) {
        self.set_memorys_on(Side::Both, addr, len, ram, offset, None);
    }

    /// Owner-gated [`set_read_memorys`](Self::set_read_memorys).
    pub fn set_read_memorys2(&self, addr: u32, len: u32, ram: &Ram, offset: usize, owner: DeviceKey) {
        self.set_memorys_on(Side::Read, addr, len, ram, offset, Some(owner));
    }

    pub fn set_write_memorys2(&self, addr: u32, len: u32, ram: &Ram, offset: usize, owner: DeviceKey) {
        self.set_memorys_on(Side::Write, addr, len, ram, offset, Some(owner));
    }

    pub fn set_memorys2(&self, addr: u32, len: u32, ram: &Ram, offset: usize, owner: DeviceKey) {
        self.set_memorys_on(Side::Both, addr, len, ram, offset, Some(owner));
    }

    // -- device traps --

    pub fn set_func<D: 'static>(
        &self,
        addr: u32,
        dev: &Weak<RefCell<D>>,
        rd: ReadFn<D>,
        wr: WriteFn<D>,
    ) {
        self.set_funcs(addr, PAGE_SIZE as u32, dev, rd, wr);
    }

    /// Route reads and writes of `len` bytes at `addr` to device handlers.
    /// Handlers receive the full bus address.
    pub fn set_funcs<D: 'static>(
        &self,
        addr: u32,
        len: u32,
        dev: &Weak<RefCell<D>>,
        rd: ReadFn<D>,
        wr: WriteFn<D>,
    ) {
        self.set_funcs_on(addr, len, dev, rd, wr, None);
    }

    /// Owner-gated [`set_funcs`](Self::set_funcs); each side is checked on its own.
    pub fn set_funcs2<D: 'static>(
        &self,
        addr: u32,
        len: u32,
        dev: &Weak<RefCell<D>>,
        rd: ReadFn<D>,
        wr: WriteFn<D>,
        owner: DeviceKey,
    ) {
        self.set_funcs_on(addr, len, dev, rd, wr, Some(owner));
    }

    pub fn set_read_func<D: 'static>(&self, addr: u32, len: u32, dev: &Weak<RefCell<D>>, rd: ReadFn<D>) {
        let trap = read_trap(dev, rd);
        self.for_pages(addr, len, |_, page, _| page.read = ReadTarget::Func(trap.clone()));
    }

    pub fn set_write_func<D: 'static>(&self, addr: u32, len: u32, dev: &Weak<RefCell<D>>, wr: WriteFn<D>) {
        let trap = write_trap(dev, wr);
        self.for_pages(addr, len, |_, page, _| page.write = WriteTarget::Func(trap.clone()));
    }

    /// Make a range read as open bus and swallow writes.
    pub fn set_unmapped(&self, side: Side, addr: u32, len: u32) {
        self.for_pages(addr, len, |_, page, _| {
            if side.read() {
                page.read = ReadTarget::Unmapped;
            }
            if side.write() {
                page.write = WriteTarget::Unmapped;
            }
        });
    }

    // -- ownership --

    pub fn set_read_owner(&self, addr: u32, len: u32, owner: Option<DeviceKey>) {
        self.set_owner_on(Side::Read, addr, len, owner);
    }

    pub fn set_write_owner(&self, addr: u32, len: u32, owner: Option<DeviceKey>) {
        self.set_owner_on(Side::Write, addr, len, owner);
    }

    pub fn set_owner(&self, addr: u32, len: u32, owner: Option<DeviceKey>) {
        self.set_owner_on(Side::Both, addr, len, owner);
    }

    pub fn read_owner(&self, addr: u32) -> Option<DeviceKey> {
        self.owners
            .borrow()
            .get((addr >> PAGE_BITS) as usize)
            .and_then(|o| o.read)
    }

    pub fn write_owner(&self, addr: u32) -> Option<DeviceKey> {
        self.owners
            .borrow()
            .get((addr >> PAGE_BITS) as usize)
            .and_then(|o| o.write)
    }

    fn set_owner_on(&self, side: Side, addr: u32, len: u32, owner: Option<DeviceKey>) {
        let mut owners = self.owners.borrow_mut();
        for idx in page_range(addr, len, owners.len()) {
            if side.read() {
                owners[idx].read = owner;
            }
            if side.write() {
                owners[idx].write = owner;
            }
        }
    }

    fn set_memorys_on(
        &self,
        side: Side,
        addr: u32,
        len: u32,
        ram: &Ram,
        offset: usize,
        owner: Option<DeviceKey>,
    ) {
        let owners = self.owners.borrow();
        self.for_pages(addr, len, |idx, page, n| {
            let base = offset + (n << PAGE_BITS);
            if side.read() && gate(owners[idx].read, owner) {
                page.read = ReadTarget::Memory {
                    ram: ram.clone(),
                    base,
                };
            }
            if side.write() && gate(owners[idx].write, owner) {
                page.write = WriteTarget::Memory {
                    ram: ram.clone(),
                    base,
                };
            }
        });
    }

    fn set_funcs_on<D: 'static>(
        &self,
        addr: u32,
        len: u32,
        dev: &Weak<RefCell<D>>,
        rd: ReadFn<D>,
        wr: WriteFn<D>,
        owner: Option<DeviceKey>,
    ) {
        let rtrap = read_trap(dev, rd);
        let wtrap = write_trap(dev, wr);
        let owners = self.owners.borrow();
        self.for_pages(addr, len, |idx, page, _| {
            if gate(owners[idx].read, owner) {
                page.read = ReadTarget::Func(rtrap.clone());
            }
            if gate(owners[idx].write, owner) {
                page.write = WriteTarget::Func(wtrap.clone());
            }
        });
    }

    /// Visit every page overlapping `addr..addr+len` with its index, the page
    /// and its ordinal within the range.
    fn for_pages(&self, addr: u32, len: u32, mut f: impl FnMut(usize, &mut Page, usize)) {
        let mut pages = self.pages.borrow_mut();
        let total = pages.len();
        for (n, idx) in page_range(addr, len, total).enumerate() {
            f(idx, &mut pages[idx], n);
        }
    }
}

impl Default for MemoryBus {
    /// A 64 KiB space.
    fn default() -> Self {
        Self::new(0x10000 >> PAGE_BITS)
    }
}

/// An ungated setter always applies; a gated one only when the caller owns the side.
fn gate(current: Option<DeviceKey>, caller: Option<DeviceKey>) -> bool {
    match caller {
        None => true,
        Some(caller) => current == Some(caller),
    }
}

fn page_range(addr: u32, len: u32, total: usize) -> std::ops::Range<usize> {
    let first = (addr >> PAGE_BITS) as usize;
    let last = ((addr as u64 + len as u64 + PAGE_MASK as u64) >> PAGE_BITS) as usize;
    debug_assert!(
        last <= total,
        "page range {:#x}+{:#x} beyond {} pages",
        addr,
        len,
        total
    );
    first.min(total)..last.min(total)
}

fn read_trap<D: 'static>(dev: &Weak<RefCell<D>>, rd: ReadFn<D>) -> ReadTrap {
    let dev = dev.clone();
    Rc::new(move |addr| match dev.upgrade() {
        Some(dev) => match dev.try_borrow_mut() {
            Ok(mut dev) => rd(&mut dev, addr),
            Err(_) => {
                tracing::warn!("[MEM] Re-entrant read trap at {:04X}", addr);
                0xff
            }
        },
        None => 0xff,
    })
}

fn write_trap<D: 'static>(dev: &Weak<RefCell<D>>, wr: WriteFn<D>) -> WriteTrap {
    let dev = dev.clone();
    Rc::new(move |addr, data| {
        if let Some(dev) = dev.upgrade() {
            match dev.try_borrow_mut() {
                Ok(mut dev) => wr(&mut dev, addr, data),
                Err(_) => tracing::warn!("[MEM] Re-entrant write trap at {:04X}", addr),
            }
        }
    })
}
