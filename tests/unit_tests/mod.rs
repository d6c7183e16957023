mod calculus;
mod fullspace;
mod kkt;
mod vector;
