mod common;

use common::*;
use ext2_fs::Ext2Error;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    AllocBlock,
    FreeBlock(usize),
    AllocInode,
    FreeInode(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::AllocBlock),
        2 => any::<usize>().prop_map(Op::FreeBlock),
        2 => Just(Op::AllocInode),
        1 => any::<usize>().prop_map(Op::FreeInode),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn counters_match_bitmaps(ops in prop::collection::vec(op(), 1..120)) {
        let disk = fresh_disk(96, 1024, 512);
        let fs = mount(&disk);
        let mut fs = fs.lock();
        let mut blocks: Vec<u32> = Vec::new();
        let mut inodes: Vec<u32> = Vec::new();
        for op in ops {
            match op {
                Op::AllocBlock => match fs.alloc_block() {
                    Ok(block) => {
                        prop_assert!(!blocks.contains(&block));
                        blocks.push(block);
                    }
                    Err(e) => {
                        prop_assert_eq!(e, Ext2Error::NoSpace);
                    }
                },
                Op::FreeBlock(i) if !blocks.is_empty() => {
                    let block = blocks.swap_remove(i % blocks.len());
                    fs.free_block(block).unwrap();
                }
                Op::AllocInode => match fs.alloc_inode() {
                    Ok(ino) => {
                        prop_assert!(ino > 11);
                        prop_assert!(!inodes.contains(&ino));
                        inodes.push(ino);
                    }
                    Err(e) => {
                        prop_assert_eq!(e, Ext2Error::NoSpace);
                    }
                },
                Op::FreeInode(i) if !inodes.is_empty() => {
                    let ino = inodes.swap_remove(i % inodes.len());
                    fs.free_inode(ino).unwrap();
                }
                _ => {}
            }
            let usage = fs.bitmap_usage().unwrap();
            prop_assert!(usage.is_consistent(), "{:?}", usage);
        }
        for block in blocks.drain(..) {
            fs.free_block(block).unwrap();
        }
        for ino in inodes.drain(..) {
            fs.free_inode(ino).unwrap();
        }
        let stat = fs.statfs().unwrap();
        prop_assert_eq!(stat.free_inodes, stat.inodes - 11);
    }
}

#[test]
fn freed_blocks_are_reused_lowest_first() {
    let disk = fresh_disk(64, 1024, 512);
    let fs = mount(&disk);
    let mut fs = fs.lock();
    let a = fs.alloc_block().unwrap();
    let b = fs.alloc_block().unwrap();
    let c = fs.alloc_block().unwrap();
    assert_eq!((b, c), (a + 1, a + 2));
    fs.free_block(b).unwrap();
    assert_eq!(fs.alloc_block().unwrap(), b);
    assert!(matches!(fs.free_block(1000), Err(Ext2Error::OutOfRange)));
    assert!(matches!(fs.free_block(64), Err(Ext2Error::OutOfRange)));
    assert!(matches!(fs.free_inode(0), Err(Ext2Error::OutOfRange)));
    fs.free_block(c).unwrap();
    assert!(matches!(fs.free_block(c), Err(Ext2Error::Corrupted(_))));
}

#[test]
fn exhausting_blocks_reports_no_space() {
    let disk = fresh_disk(64, 1024, 512);
    let fs = mount(&disk);
    let mut fs = fs.lock();
    let free = fs.superblock().free_blocks_count;
    let taken: Vec<u32> = (0..free).map(|_| fs.alloc_block().unwrap()).collect();
    assert_eq!(fs.alloc_block(), Err(Ext2Error::NoSpace));
    assert_eq!(fs.superblock().free_blocks_count, 0);
    for block in taken {
        fs.free_block(block).unwrap();
    }
    assert_eq!(fs.superblock().free_blocks_count, free);
}

#[test]
fn inodes_start_after_lost_and_found() {
    let disk = fresh_disk(64, 1024, 512);
    let fs = mount(&disk);
    let mut fs = fs.lock();
    assert_eq!(fs.alloc_inode(), Ok(12));
    assert_eq!(fs.alloc_inode(), Ok(13));
    fs.free_inode(12).unwrap();
    assert_eq!(fs.alloc_inode(), Ok(12));
    let usage = fs.bitmap_usage().unwrap();
    assert_eq!(usage.inodes_used, 13);
    assert!(usage.is_consistent());
}
