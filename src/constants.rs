// Blob layout of a scraped entry
pub const COVER_BLOB: &str = "Banner.jpg";
pub const PROFILE_BLOB: &str = "Logo.jpg";
pub const POSTS_DIR: &str = "Posts/";
pub const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png"];

// Destination naming
pub const COVER_SUFFIX: &str = "cover_image";
pub const PROFILE_SUFFIX: &str = "profile_image";
pub const POST_IMAGE_TYPE: &str = "post_image";
pub const DEST_EXTENSION: &str = ".jpg";
pub const IMAGE_CONTENT_TYPE: &str = "image/jpeg";

// Defaults
pub const DEFAULT_STORAGE_HOST: &str = "googleapis.com";
pub const DEFAULT_SOURCE_PREFIX: &str = "Webscraping/Paises/New Web Scraping/Brasil/";
pub const DEFAULT_COUNTRY: &str = "Brasil";
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;
pub const DEFAULT_MAX_NAME_LEN: usize = 512;
pub const DEFAULT_UPLOAD_WORKERS: usize = 5;
pub const DEFAULT_CLASSIFY_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_ACTOR_COUNTRY: &str = "Mexico";

// Field length limits for actor page records
pub const MAX_ADDRESS_LEN: usize = 500;
pub const MAX_CATEGORY_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 100;
pub const MAX_INTRO_LEN: usize = 1000;
pub const MAX_PHONE_LEN: usize = 50;
pub const MAX_TITLE_LEN: usize = 300;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
