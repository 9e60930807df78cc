use challoc::Challoc;

#[global_allocator]
static ALLOCATOR: Challoc = Challoc::new();

fn main() {
    let mut primes = vec![2u64, 3, 5, 7, 11];
    primes.push(13);

    let message = format!("{} primes served through the page chunks", primes.len());
    println!("{message}");

    let doubled: Vec<u64> = primes.iter().map(|p| p * 2).collect();
    println!("doubled: {doubled:?}");
}
