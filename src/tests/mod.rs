mod helpers;

mod staging;
