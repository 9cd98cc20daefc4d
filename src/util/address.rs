/// Address of a function, as recorded in stacks and event records.
///
/// Takes the function as `f as *const ()` so any signature fits.
pub fn address_of(function: *const ()) -> u64 {
    function as usize as u64
}
