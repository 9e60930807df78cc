use std::alloc::{GlobalAlloc, Layout};

use challoc::Challoc;

fn main() {
    let challoc = Challoc::new();

    unsafe {
        let layout = Layout::array::<u8>(1024).unwrap();
        let address = challoc.alloc(layout);
        println!("requested {} bytes, got {:p}", layout.size(), address);

        address.write_bytes(42, layout.size());
        println!("first byte back: {}", address.read());

        challoc.dealloc(address, layout);

        // freshly freed memory is the first thing retried
        let again = challoc.alloc(layout);
        println!("allocated again, got {:p}", again);
        challoc.dealloc(again, layout);
    }
}
