/// One machine word: a signed integer holding up to 8 decimal digits.
pub type Word = i32;

/// Largest magnitude an arithmetic result may reach; anything above is an overflow.
pub const ALU_MAX: Word = 9_999_999;

/// Largest encodable word (8 decimal digits).
pub const WORD_MAX: Word = 99_999_999;
