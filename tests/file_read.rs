//! SPEC_FULL §8 scenario 6: a large file read back in fixed-size chunks through the pool, with
//! a final zero-byte `on_read` marking EOF.

use evloop::{File, FileCallbacks, Loop, OpenFlags, Pool, PoolConfig};
use std::cell::RefCell;
use std::io::Write as _;
use std::rc::Rc;

#[test]
fn reads_one_megabyte_in_four_kilobyte_chunks() {
    const TOTAL: usize = 1024 * 1024;
    const CHUNK: usize = 4096;

    let mut lp = Loop::new().unwrap();
    let pool = Pool::new(&mut lp, PoolConfig { workers: 4, ..PoolConfig::default() }).unwrap();

    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 256) as u8).collect();
    tmp.write_all(&payload).unwrap();
    tmp.flush().unwrap();

    let sizes = Rc::new(RefCell::new(Vec::new()));
    let received = Rc::new(RefCell::new(Vec::new()));
    let eof = Rc::new(RefCell::new(false));

    let mut callbacks: FileCallbacks<()> = FileCallbacks::default();
    callbacks.on_open = Some(Box::new(|f: &File<()>, lp: &mut Loop, result| {
        assert!(result.is_ok());
        f.read_start(lp, CHUNK).unwrap();
    }));
    {
        let sizes = Rc::clone(&sizes);
        let received = Rc::clone(&received);
        let eof = Rc::clone(&eof);
        callbacks.on_read = Some(Box::new(move |f: &File<()>, _lp, count| {
            sizes.borrow_mut().push(count);
            if count == 0 {
                *eof.borrow_mut() = true;
            } else {
                received.borrow_mut().extend_from_slice(&f.read_buf()[..count]);
            }
        }));
    }

    let file = File::new((), callbacks);
    file.attach(pool);
    file.open_path(&mut lp, tmp.path().to_path_buf(), OpenFlags::read_only()).unwrap();

    lp.run_until(|| *eof.borrow(), 5000).unwrap();

    assert!(*eof.borrow(), "file read never reached EOF");
    assert_eq!(*sizes.borrow().last().unwrap(), 0, "final on_read must report 0 bytes");
    let non_eof_sizes = &sizes.borrow()[..sizes.borrow().len() - 1];
    assert_eq!(non_eof_sizes.len(), TOTAL / CHUNK, "expected exactly 256 full chunks");
    assert!(non_eof_sizes.iter().all(|&n| n == CHUNK), "every chunk but the last should be full");
    assert_eq!(&*received.borrow(), &payload, "reassembled file contents must match the original");
}
